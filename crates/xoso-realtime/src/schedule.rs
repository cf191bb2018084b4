//! Daily live windows of the lottery draws, in Vietnam time (UTC+7).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveTime, TimeDelta, Timelike, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const UTC_OFFSET_HOURS: i64 = 7;
const WINDOW_MINUTES: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawRegion {
    South,
    Central,
    North,
}

impl DrawRegion {
    pub const ALL: [DrawRegion; 3] = [Self::South, Self::Central, Self::North];

    /// Start of the live window, minutes after local midnight.
    fn start_minute(self) -> u32 {
        match self {
            Self::South => 16 * 60 + 10,
            Self::Central => 17 * 60 + 10,
            Self::North => 18 * 60 + 10,
        }
    }

    fn end_minute(self) -> u32 {
        self.start_minute() + WINDOW_MINUTES
    }

    pub fn is_live(self, now: DateTime<Utc>) -> bool {
        let minute = local_minute(now);
        (self.start_minute()..self.end_minute()).contains(&minute)
    }

    /// The next time the live flag flips, and its value from then on.
    pub fn next_transition(self, now: DateTime<Utc>) -> Transition {
        let local = now + TimeDelta::hours(UTC_OFFSET_HOURS);
        let midnight = local.date_naive().and_time(NaiveTime::default());
        let minute = local_minute(now);

        let (live, day, boundary) = if minute < self.start_minute() {
            (true, midnight, self.start_minute())
        } else if minute < self.end_minute() {
            (false, midnight, self.end_minute())
        } else {
            (true, midnight + Days::new(1), self.start_minute())
        };

        let at = day + TimeDelta::minutes(i64::from(boundary)) - TimeDelta::hours(UTC_OFFSET_HOURS);
        Transition {
            live,
            at: at.and_utc(),
        }
    }
}

impl fmt::Display for DrawRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::South => "south",
            Self::Central => "central",
            Self::North => "north",
        })
    }
}

impl FromStr for DrawRegion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "south" | "mn" => Ok(Self::South),
            "central" | "mt" => Ok(Self::Central),
            "north" | "mb" => Ok(Self::North),
            other => Err(format!("unknown draw region: {}", other)),
        }
    }
}

fn local_minute(now: DateTime<Utc>) -> u32 {
    let local = now + TimeDelta::hours(UTC_OFFSET_HOURS);
    local.hour() * 60 + local.minute()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Live flag after the transition.
    pub live: bool,
    pub at: DateTime<Utc>,
}

/// Publishes whether a region's draw is live, flipping at each boundary.
pub struct LiveWindow {
    rx: watch::Receiver<bool>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl LiveWindow {
    pub fn spawn(region: DrawRegion) -> Self {
        let (tx, rx) = watch::channel(region.is_live(Utc::now()));
        let token = CancellationToken::new();
        let task = tokio::spawn(run(region, tx, token.clone()));
        Self { rx, token, task }
    }

    pub fn is_live(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for LiveWindow {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run(region: DrawRegion, tx: watch::Sender<bool>, token: CancellationToken) {
    loop {
        let now = Utc::now();
        let next = region.next_transition(now);
        let wait = (next.at - now).to_std().unwrap_or(Duration::ZERO);
        debug!("{} draw: live={} in {:?}", region, next.live, wait);

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {
                tx.send_replace(next.live);
                info!("{} draw is {}", region, if next.live { "live" } else { "over" });
            }
        }
    }
}
