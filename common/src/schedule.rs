use std::time::Duration;

use crate::config::TaskPeriods;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeTask {
    SampleBrightness,
    RequestTemperature,
    ReceiveTemperature,
    PublishTelemetry,
}

#[derive(Debug, Clone)]
struct Slot {
    task: NodeTask,
    period: Duration,
    next_due: Duration,
}

/// Repeating timers for the node's periodic tasks.
///
/// Tasks fire one period after registration and then every period. A caller
/// that falls behind gets each overdue task once, not a burst of catch-up runs.
#[derive(Debug, Clone)]
pub struct TaskSchedule {
    slots: Vec<Slot>,
}

impl TaskSchedule {
    pub fn new(periods: &TaskPeriods, start: Duration) -> Self {
        let mut schedule = Self { slots: Vec::new() };
        schedule.register(NodeTask::SampleBrightness, periods.brightness_ms, start);
        schedule.register(NodeTask::RequestTemperature, periods.temperature_ms, start);
        schedule.register(NodeTask::ReceiveTemperature, periods.temperature_ms, start);
        schedule.register(NodeTask::PublishTelemetry, periods.publish_ms, start);
        schedule
    }

    fn register(&mut self, task: NodeTask, period_ms: u64, start: Duration) {
        let period = Duration::from_millis(period_ms.max(1));
        self.slots.push(Slot {
            task,
            period,
            next_due: start + period,
        });
    }

    /// Tasks due at `now`, in registration order.
    pub fn due(&mut self, now: Duration) -> Vec<NodeTask> {
        let mut due = Vec::new();
        for slot in &mut self.slots {
            if now < slot.next_due {
                continue;
            }

            due.push(slot.task);
            let missed = (now - slot.next_due).as_nanos() / slot.period.as_nanos();
            let advance = slot.period.as_nanos() * (missed + 1);
            slot.next_due = slot
                .next_due
                .saturating_add(Duration::from_nanos(u64::try_from(advance).unwrap_or(u64::MAX)));
        }
        due
    }

    /// Earliest uptime at which any task becomes due.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.slots.iter().map(|slot| slot.next_due).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn fires_after_first_period_in_registration_order() {
        let mut schedule = TaskSchedule::new(&TaskPeriods::default(), ms(0));

        assert!(schedule.due(ms(199)).is_empty());
        assert_eq!(
            schedule.due(ms(200)),
            vec![
                NodeTask::SampleBrightness,
                NodeTask::RequestTemperature,
                NodeTask::ReceiveTemperature,
            ]
        );
        assert_eq!(schedule.next_deadline(), Some(ms(400)));
    }

    #[test]
    fn publish_runs_once_per_second() {
        let mut schedule = TaskSchedule::new(&TaskPeriods::default(), ms(0));

        let publishes = (1..=50)
            .flat_map(|tick| schedule.due(ms(tick * 100)))
            .filter(|task| *task == NodeTask::PublishTelemetry)
            .count();

        assert_eq!(publishes, 5);
    }

    #[test]
    fn late_poll_does_not_burst() {
        let mut schedule = TaskSchedule::new(&TaskPeriods::default(), ms(0));

        let due = schedule.due(ms(1_050));
        assert_eq!(due.len(), 4);

        // Next brightness deadline realigns to the 200 ms grid.
        assert_eq!(schedule.due(ms(1_150)), Vec::new());
        assert_eq!(schedule.due(ms(1_200)).len(), 3);
    }
}
