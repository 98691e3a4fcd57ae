//! Transfer counters with hourly, daily, weekly, monthly and yearly windows.
//!
//! Windows are reset on calendar boundaries in local time. The scheduler
//! wakes up at the top of every hour and works out which windows rolled
//! over since it last ran.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::slave::SlaveManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Window {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

/// Bytes and files moved in each window, plus the all-time total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub all: u64,
    pub year: u64,
    pub month: u64,
    pub week: u64,
    pub day: u64,
    pub hour: u64,
}

impl Counter {
    pub fn add(&mut self, n: u64) {
        self.all += n;
        self.year += n;
        self.month += n;
        self.week += n;
        self.day += n;
        self.hour += n;
    }

    pub fn reset(&mut self, window: Window) {
        match window {
            Window::Hour => self.hour = 0,
            Window::Day => self.day = 0,
            Window::Week => self.week = 0,
            Window::Month => self.month = 0,
            Window::Year => self.year = 0,
        }
    }
}

/// Upload and download statistics of one slave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub uploaded_bytes: Counter,
    pub uploaded_files: Counter,
    pub downloaded_bytes: Counter,
    pub downloaded_files: Counter,
}

impl TransferStats {
    pub fn record_upload(&mut self, bytes: u64) {
        self.uploaded_bytes.add(bytes);
        self.uploaded_files.add(1);
    }

    pub fn record_download(&mut self, bytes: u64) {
        self.downloaded_bytes.add(bytes);
        self.downloaded_files.add(1);
    }

    pub fn reset(&mut self, window: Window) {
        self.uploaded_bytes.reset(window);
        self.uploaded_files.reset(window);
        self.downloaded_bytes.reset(window);
        self.downloaded_files.reset(window);
    }
}

/// Windows whose boundary lies in `(prev, now]`, shortest first.
pub fn rolled_windows<Tz: TimeZone>(prev: &DateTime<Tz>, now: &DateTime<Tz>) -> Vec<Window> {
    let mut rolled = Vec::new();
    if now <= prev {
        return rolled;
    }
    let hour_changed = (now.clone() - prev.clone()).num_hours() >= 1 || now.hour() != prev.hour();
    if !hour_changed {
        return rolled;
    }
    rolled.push(Window::Hour);
    if now.date_naive() == prev.date_naive() {
        return rolled;
    }
    rolled.push(Window::Day);
    let (pw, nw) = (prev.iso_week(), now.iso_week());
    if (pw.year(), pw.week()) != (nw.year(), nw.week()) {
        rolled.push(Window::Week);
    }
    if (prev.year(), prev.month()) != (now.year(), now.month()) {
        rolled.push(Window::Month);
    }
    if prev.year() != now.year() {
        rolled.push(Window::Year);
    }
    rolled
}

/// Time left until the next top of the hour.
pub fn until_next_hour(now: &DateTime<Local>) -> Duration {
    let into_hour = u64::from(now.minute()) * 60 + u64::from(now.second());
    Duration::from_secs(3600 - into_hour.min(3599))
}

/// Resets the slave statistics windows as calendar boundaries pass.
pub fn spawn_resetter(manager: Arc<SlaveManager>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = Local::now();
        loop {
            let wait = until_next_hour(&last);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            let now = Local::now();
            let rolled = rolled_windows(&last, &now);
            debug!("statistics windows rolled: {rolled:?}");
            for window in rolled {
                manager.reset(window);
            }
            last = now;
        }
        info!("statistics resetter stopped");
    })
}
