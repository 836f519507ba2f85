use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{debug, warn};

use crate::{
    config::{parse_time_of_day, SchedulerConfig},
    error::{ConfigurationError, PriceFeedError},
    types::ScheduleDecision,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishWindow {
    times: Vec<NaiveTime>,
}

impl FinishWindow {
    pub fn new(mut times: Vec<NaiveTime>, fallback: NaiveTime) -> Self {
        times.sort();
        times.dedup();
        if times.is_empty() {
            times.push(fallback);
        }
        Self { times }
    }

    pub fn parse(values: &[String], fallback: NaiveTime) -> Result<Self, ConfigurationError> {
        let times = values
            .iter()
            .map(|value| parse_time_of_day(value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(times, fallback))
    }

    pub fn times(&self) -> &[NaiveTime] {
        &self.times
    }

    pub fn next_deadline(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = now.timezone();
        let today = now.date_naive();

        let later_today = self
            .times
            .iter()
            .filter_map(|time| localize(&tz, today.and_time(*time)))
            .find(|candidate| candidate > now);
        if later_today.is_some() {
            return later_today;
        }

        let first = self.times.first()?;
        localize(&tz, today.succ_opt()?.and_time(*first))
    }
}

// Times skipped by a DST jump move forward an hour; repeated times take the earlier instant.
fn localize(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&naive).earliest().or_else(|| {
        let shifted = naive.checked_add_signed(TimeDelta::hours(1))?;
        tz.from_local_datetime(&shifted).earliest()
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub price: f64,
}

pub trait PriceFeed {
    fn request(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), PriceFeedError>;

    fn best_slots(&self, count: usize) -> Vec<PriceSlot>;

    fn best_slot(&self) -> Option<PriceSlot> {
        self.best_slots(1).into_iter().next()
    }
}

pub fn cheapest_slots(slots: &[PriceSlot], count: usize) -> Vec<PriceSlot> {
    let mut sorted = slots.to_vec();
    sorted.sort_by(|a, b| a.price.total_cmp(&b.price).then(a.start.cmp(&b.start)));
    sorted.truncate(count);
    sorted
}

#[derive(Debug, Clone, Default)]
pub struct StaticPriceFeed {
    slots: Vec<PriceSlot>,
    window: Vec<PriceSlot>,
}

impl StaticPriceFeed {
    pub fn new(slots: Vec<PriceSlot>) -> Self {
        Self {
            slots,
            window: Vec::new(),
        }
    }
}

impl PriceFeed for StaticPriceFeed {
    fn request(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), PriceFeedError> {
        self.window = self
            .slots
            .iter()
            .filter(|slot| slot.start < end && slot.end > start)
            .copied()
            .collect();
        Ok(())
    }

    fn best_slots(&self, count: usize) -> Vec<PriceSlot> {
        cheapest_slots(&self.window, count)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulePlan {
    pub decision: ScheduleDecision,
    pub deadline: Option<DateTime<Tz>>,
    pub latest_start: Option<DateTime<Tz>>,
    pub price_slot: Option<PriceSlot>,
}

impl SchedulePlan {
    fn unschedulable(deadline: Option<DateTime<Tz>>, latest_start: Option<DateTime<Tz>>) -> Self {
        Self {
            decision: ScheduleDecision::NoEligibleSlot,
            deadline,
            latest_start,
            price_slot: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleOptimizer {
    start_now_threshold: TimeDelta,
    max_delay_secs: u64,
    price_padding: TimeDelta,
}

impl Default for ScheduleOptimizer {
    fn default() -> Self {
        Self::new(&SchedulerConfig::default())
    }
}

impl ScheduleOptimizer {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            start_now_threshold: secs_delta(config.start_now_threshold_secs),
            max_delay_secs: config.max_delay_secs,
            price_padding: secs_delta(config.price_padding_secs),
        }
    }

    pub fn compute_delay(
        &self,
        now: DateTime<Tz>,
        window: &FinishWindow,
        estimated_duration: Duration,
        price_feed: Option<&mut (dyn PriceFeed + Send)>,
    ) -> ScheduleDecision {
        self.plan(now, window, estimated_duration, price_feed)
            .decision
    }

    pub fn plan(
        &self,
        now: DateTime<Tz>,
        window: &FinishWindow,
        estimated_duration: Duration,
        price_feed: Option<&mut (dyn PriceFeed + Send)>,
    ) -> SchedulePlan {
        let Some(deadline) = window.next_deadline(&now) else {
            return SchedulePlan::unschedulable(None, None);
        };
        let Some(latest_start) = TimeDelta::from_std(estimated_duration)
            .ok()
            .and_then(|duration| deadline.checked_sub_signed(duration))
        else {
            return SchedulePlan::unschedulable(Some(deadline), None);
        };

        if latest_start <= now {
            debug!(%deadline, %latest_start, "deadline no longer reachable");
            return SchedulePlan::unschedulable(Some(deadline), Some(latest_start));
        }

        let price_slot =
            price_feed.and_then(|feed| self.best_slot_before(feed, &now, &latest_start));

        let candidate = match price_slot {
            Some(slot) => slot.start.with_timezone(&now.timezone()),
            None => latest_start,
        };

        let decision = self.decision_for(&now, &candidate);
        debug!(%deadline, %latest_start, %candidate, ?decision, "schedule computed");

        SchedulePlan {
            decision,
            deadline: Some(deadline),
            latest_start: Some(latest_start),
            price_slot,
        }
    }

    // Slots that begin at or after `latest_start` are never adopted.
    fn best_slot_before(
        &self,
        feed: &mut (dyn PriceFeed + Send),
        now: &DateTime<Tz>,
        latest_start: &DateTime<Tz>,
    ) -> Option<PriceSlot> {
        let window_start = now.with_timezone(&Utc);
        let window_end = latest_start.with_timezone(&Utc) + self.price_padding;

        if let Err(err) = feed.request(window_start, window_end) {
            warn!("price feed unavailable, scheduling on deadline only: {err}");
            return None;
        }

        let slot = feed.best_slot()?;
        let slot_start = slot.start.with_timezone(&now.timezone());
        if slot_start >= *latest_start {
            debug!(start = %slot_start, "best price slot ignored");
            return None;
        }
        Some(slot)
    }

    fn decision_for(&self, now: &DateTime<Tz>, candidate: &DateTime<Tz>) -> ScheduleDecision {
        let delay = candidate.signed_duration_since(*now);
        if delay < TimeDelta::zero() {
            return ScheduleDecision::NoEligibleSlot;
        }
        if delay <= self.start_now_threshold {
            return ScheduleDecision::StartNow;
        }

        let secs = u64::try_from(delay.num_seconds())
            .unwrap_or(0)
            .min(self.max_delay_secs);
        ScheduleDecision::StartIn(u32::try_from(secs).unwrap_or(u32::MAX))
    }
}

fn secs_delta(secs: u64) -> TimeDelta {
    TimeDelta::try_seconds(i64::try_from(secs).unwrap_or(i64::MAX)).unwrap_or(TimeDelta::MAX)
}
