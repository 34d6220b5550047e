//! Background timers owned by the controller: the idle heartbeat, the day
//! change notice and the logon settle delay.
//!
//! Each timer holds the controller weakly and ends once it is gone.

use std::sync::Weak;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::time::MissedTickBehavior;

use super::ControllerInner;
use crate::transport::Network;

/// How often the day timer looks at the calendar.
pub(super) const DAY_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Remembers the last day seen and reports when it changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct DayTimer {
    today: NaiveDate,
}

impl DayTimer {
    pub(super) const fn new(today: NaiveDate) -> Self {
        Self { today }
    }

    /// Returns the new day if `today` differs from the last one seen.
    pub(super) fn check(&mut self, today: NaiveDate) -> Option<NaiveDate> {
        if today == self.today {
            return None;
        }
        self.today = today;
        Some(today)
    }
}

/// E.g. "Friday, 16. October 2026".
pub(super) fn format_day(day: NaiveDate) -> String {
    day.format("%A, %-d. %B %Y").to_string()
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}

pub(super) async fn idle_loop<N: Network>(inner: Weak<ControllerInner<N>>, period: Duration) {
    let mut tick = ticker(period);
    tick.tick().await;
    loop {
        tick.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.idle_tick();
    }
    tracing::debug!("idle timer stopped");
}

pub(super) async fn day_loop<N: Network>(inner: Weak<ControllerInner<N>>, period: Duration) {
    let mut day = DayTimer::new(chrono::Local::now().date_naive());
    let mut tick = ticker(period);
    tick.tick().await;
    loop {
        tick.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let Some(today) = day.check(chrono::Local::now().date_naive()) {
            tracing::info!(%today, "day changed");
            inner.system(format!("Day changed to {}", format_day(today)));
        }
    }
}

/// Marks logon complete once `delay` has passed.
pub(super) async fn settle<N: Network>(inner: Weak<ControllerInner<N>>, delay: Duration) {
    tokio::time::sleep(delay).await;
    if let Some(inner) = inner.upgrade() {
        inner.logon_settled();
    }
}
