//! State-machine driver for tasks with long, multi-slice interactions.
//!
//! The idiom: the task's data struct holds its variables, each protocol
//! step is a plain function, and the machine dispatches the current step
//! repeatedly within one slice until a step asks to stop (usually because
//! it is waiting for I/O and has arranged a wake-up).

use crate::task::{TaskRef, ThreadNum};

pub type StateFn<S> = fn(&mut S, &TaskRef, ThreadNum) -> StateResult<S>;

pub enum StateResult<S> {
    /// Continue with the given step within this slice.
    Next(StateFn<S>),
    /// End the slice; the machine stays on the current step.
    Stop,
    /// End the slice and resume from the given step next time.
    StopAt(StateFn<S>),
}

pub struct StatesMachine<S> {
    cur_state: StateFn<S>,
}

impl<S> StatesMachine<S> {
    pub fn new(start: StateFn<S>) -> Self {
        Self { cur_state: start }
    }

    pub fn set_state(&mut self, state: StateFn<S>) {
        self.cur_state = state;
    }

    pub fn run(&mut self, data: &mut S, task: &TaskRef, thr_num: ThreadNum) {
        loop {
            match (self.cur_state)(data, task, thr_num) {
                StateResult::Next(next) => self.cur_state = next,
                StateResult::Stop => return,
                StateResult::StopAt(next) => {
                    self.cur_state = next;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{SrvTask, TaskHandler};

    struct Counter {
        hits: Vec<&'static str>,
    }

    fn st_first(data: &mut Counter, _t: &TaskRef, _n: ThreadNum) -> StateResult<Counter> {
        data.hits.push("first");
        StateResult::Next(st_second)
    }

    fn st_second(data: &mut Counter, _t: &TaskRef, _n: ThreadNum) -> StateResult<Counter> {
        data.hits.push("second");
        StateResult::StopAt(st_third)
    }

    fn st_third(data: &mut Counter, _t: &TaskRef, _n: ThreadNum) -> StateResult<Counter> {
        data.hits.push("third");
        StateResult::Stop
    }

    struct Nop;
    impl TaskHandler for Nop {
        fn execute_slice(&mut self, _task: &TaskRef, _thr_num: ThreadNum) {}
    }

    #[test]
    fn machine_chains_states_within_a_slice() {
        let task = SrvTask::new(Box::new(Nop));
        let mut data = Counter { hits: Vec::new() };
        let mut sm = StatesMachine::new(st_first);
        sm.run(&mut data, &task, 1);
        assert_eq!(data.hits, ["first", "second"]);
        // Next "slice" resumes from the parked state.
        sm.run(&mut data, &task, 1);
        assert_eq!(data.hits, ["first", "second", "third"]);
    }
}
