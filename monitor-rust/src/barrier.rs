//! Subtask barrier: a shared arrival counter over a list of subtask messages.

use mavc_types::Message;

#[derive(Debug, Clone, PartialEq)]
pub enum BarrierStep {
    /// Still waiting for `needed - ready` more arrivals
    Waiting { ready: usize, needed: usize },
    /// Barrier filled; broadcast `message` as subtask `index`
    Release { index: usize, message: Message },
    /// The last subtask has been released and its barrier filled
    Complete,
}

#[derive(Debug)]
pub struct SubtaskBarrier {
    subtasks: Vec<Message>,
    current: usize,
    ready: usize,
    participants: usize,
}

impl SubtaskBarrier {
    pub fn new(subtasks: Vec<Message>, participants: usize) -> Self {
        Self { subtasks, current: 0, ready: 0, participants }
    }

    /// Subtask 0, dispatched as soon as the task starts.
    pub fn first(&self) -> Option<&Message> {
        self.subtasks.first()
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn total(&self) -> usize {
        self.subtasks.len()
    }

    pub fn ready(&self) -> usize {
        self.ready
    }

    /// False once the last subtask is out and none of its actions is a barrier,
    /// so no ARRIVED will ever come for it.
    pub fn awaits_arrivals(&self) -> bool {
        if self.current + 1 < self.subtasks.len() {
            return true;
        }
        self.subtasks
            .get(self.current)
            .and_then(|m| m.actions().ok())
            .is_some_and(|actions| actions.iter().any(|a| a.sync))
    }

    /// Count one arrival. Advances once the count reaches the participant count.
    pub fn arrive(&mut self) -> BarrierStep {
        self.ready += 1;
        if self.ready < self.participants {
            return BarrierStep::Waiting { ready: self.ready, needed: self.participants };
        }
        self.advance()
    }

    /// Release the next subtask without waiting for the remaining arrivals.
    pub fn force_advance(&mut self) -> BarrierStep {
        self.advance()
    }

    fn advance(&mut self) -> BarrierStep {
        self.ready = 0;
        self.current += 1;
        match self.subtasks.get(self.current) {
            Some(message) => BarrierStep::Release { index: self.current, message: message.clone() },
            None => BarrierStep::Complete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavc_types::{Action, ActionType};

    fn subtasks(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| Message::action(&[Action::new(1, ActionType::Land, true).with_param("Lat", i as f64)]))
            .collect()
    }

    #[test]
    fn one_of_two_arrivals_does_not_advance() {
        let mut barrier = SubtaskBarrier::new(subtasks(2), 2);
        assert_eq!(barrier.arrive(), BarrierStep::Waiting { ready: 1, needed: 2 });
        assert_eq!(barrier.current(), 0);

        match barrier.arrive() {
            BarrierStep::Release { index, .. } => assert_eq!(index, 1),
            other => panic!("expected release, got {other:?}"),
        }
        assert_eq!(barrier.current(), 1);
        assert_eq!(barrier.ready(), 0);
    }

    #[test]
    fn completes_after_last_barrier() {
        let mut barrier = SubtaskBarrier::new(subtasks(1), 1);
        assert!(barrier.first().is_some());
        assert_eq!(barrier.arrive(), BarrierStep::Complete);
    }

    #[test]
    fn unsynced_final_subtask_needs_no_arrivals() {
        let last = Message::action(&[Action::new(2, ActionType::Land, false)]);
        let mut barrier = SubtaskBarrier::new(vec![subtasks(1).remove(0), last], 1);
        assert!(barrier.awaits_arrivals());
        assert!(matches!(barrier.arrive(), BarrierStep::Release { index: 1, .. }));
        assert!(!barrier.awaits_arrivals());

        let synced = SubtaskBarrier::new(subtasks(1), 1);
        assert!(synced.awaits_arrivals());
    }

    #[test]
    fn forced_advance_resets_the_counter() {
        let mut barrier = SubtaskBarrier::new(subtasks(3), 3);
        barrier.arrive();
        assert!(matches!(barrier.force_advance(), BarrierStep::Release { index: 1, .. }));
        assert_eq!(barrier.ready(), 0);
        assert!(matches!(barrier.arrive(), BarrierStep::Waiting { ready: 1, needed: 3 }));
    }
}
