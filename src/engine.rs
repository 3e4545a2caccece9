use chrono::{DateTime, Local, NaiveDate, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;

use crate::amazon::AmazonReconciler;
use crate::client::{MailClient, MessageId};
use crate::config::{CarrierProfile, Config};
use crate::extract::{extract_tracking, TrackingPattern};
use crate::message::MessageRecord;

/// A metric's value for one cycle. Each metric has exactly one value kind,
/// fixed by its definition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Count(u32),
    List(Vec<String>),
    Timestamp(DateTime<Utc>),
}

impl MetricValue {
    pub fn as_count(&self) -> u32 {
        match self {
            MetricValue::Count(n) => *n,
            _ => 0,
        }
    }
}

/// Per-cycle evaluation state: the write-once result map (which doubles as
/// the memoization cache) and the cross-carrier hand-off accumulator.
pub struct CycleState {
    today: NaiveDate,
    results: HashMap<String, MetricValue>,
    delivered_by_other_carrier: u32,
}

impl CycleState {
    pub fn new(today: NaiveDate) -> Self {
        CycleState {
            today,
            results: HashMap::new(),
            delivered_by_other_carrier: 0,
        }
    }

    /// Write-once: the first value recorded for a name is final for the cycle.
    fn record(&mut self, name: &str, value: MetricValue) {
        self.results.entry(name.to_string()).or_insert(value);
    }

    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.results.get(name)
    }
}

/// One finished cycle: every requested metric is either present in `results`
/// or listed in `errors` with the failure that kept it out.
pub struct Evaluation {
    pub results: HashMap<String, MetricValue>,
    pub errors: Vec<(String, anyhow::Error)>,
}

/// Explicit identity of a metric name. Dispatch happens on this, not on
/// string suffixes scattered through the resolver.
enum Metric<'a> {
    MailUpdated,
    AmazonPackages,
    AmazonOrder,
    AmazonDelivered,
    AmazonException,
    Delivered(&'a CarrierProfile),
    Delivering(&'a CarrierProfile),
    Packages(&'a CarrierProfile),
    TotalDelivered,
    TotalTransit,
    Unknown,
}

enum SearchKind {
    Delivered,
    Delivering,
}

struct LeafResult {
    count: u32,
    tracking: Vec<String>,
}

/// The orchestrator: resolves metric names against a single cycle's state,
/// consulting the mail client lazily and memoizing every computed value.
pub struct SensorEngine<'a, C: MailClient> {
    client: &'a C,
    config: &'a Config,
    amazon: AmazonReconciler<'a>,
    tracking: HashMap<String, TrackingPattern>,
    body_phrases: HashMap<String, Vec<Regex>>,
    handoff: Vec<Regex>,
}

impl<'a, C: MailClient> SensorEngine<'a, C> {
    /// Pre-compiles all configured patterns; a bad pattern is a startup
    /// error, not a per-cycle one.
    pub fn new(client: &'a C, config: &'a Config) -> anyhow::Result<Self> {
        let mut tracking = HashMap::new();
        let mut body_phrases = HashMap::new();
        for carrier in &config.carriers {
            if let Some(pattern) = &carrier.tracking_pattern {
                tracking.insert(
                    carrier.key.clone(),
                    TrackingPattern::new(pattern, carrier.compound_tracking, carrier.whole_message)?,
                );
            }
            if !carrier.body_phrases.is_empty() {
                let compiled = carrier
                    .body_phrases
                    .iter()
                    .map(|p| Regex::new(p))
                    .collect::<Result<Vec<_>, _>>()?;
                body_phrases.insert(carrier.key.clone(), compiled);
            }
        }
        let handoff = config
            .handoff_phrases
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        let amazon = AmazonReconciler::new(&config.amazon)?;

        Ok(SensorEngine {
            client,
            config,
            amazon,
            tracking,
            body_phrases,
            handoff,
        })
    }

    /// Run one evaluation cycle for the requested metrics, dated today.
    pub fn evaluate(&self, requested: &[String]) -> Evaluation {
        self.evaluate_on(requested, Local::now().date_naive())
    }

    /// As `evaluate`, with an explicit evaluation date.
    pub fn evaluate_on(&self, requested: &[String], today: NaiveDate) -> Evaluation {
        let mut state = CycleState::new(today);
        let mut errors = Vec::new();

        for name in requested {
            if let Err(err) = self.resolve(&mut state, name) {
                log::error!("Error updating sensor: {name} reason: {err:#}");
                errors.push((name.clone(), err));
            }
        }

        Evaluation {
            results: state.results,
            errors,
        }
    }

    /// Resolve one metric, recursing into its dependencies first. Memoized:
    /// at most one mail-search round trip per metric per cycle.
    pub fn resolve(&self, state: &mut CycleState, name: &str) -> anyhow::Result<MetricValue> {
        if let Some(value) = state.get(name) {
            return Ok(value.clone());
        }

        let value = match self.classify(name) {
            Metric::MailUpdated => MetricValue::Timestamp(Utc::now()),
            Metric::AmazonPackages | Metric::AmazonOrder => {
                let summary = self.amazon.reconcile(self.client, state.today)?;
                // One search fills both metrics
                state.record("amazon_order", MetricValue::List(summary.order_numbers));
                state.record("amazon_packages", MetricValue::Count(summary.arriving_today));
                return Ok(state.get(name).cloned().unwrap_or(MetricValue::Count(0)));
            }
            Metric::AmazonDelivered => {
                MetricValue::Count(self.amazon.delivered_count(self.client, state.today)?)
            }
            Metric::AmazonException => {
                let summary = self.amazon.exceptions(self.client, state.today)?;
                // One search fills both the count and the order list
                state.record(
                    "amazon_exception_order",
                    MetricValue::List(summary.order_numbers),
                );
                state.record("amazon_exception", MetricValue::Count(summary.count));
                return Ok(state.get(name).cloned().unwrap_or(MetricValue::Count(0)));
            }
            Metric::Delivered(profile) => {
                let info = self.leaf_search(state, profile, SearchKind::Delivered)?;
                MetricValue::Count(info.count)
            }
            Metric::Delivering(profile) => {
                let delivered = self
                    .resolve(state, &format!("{}_delivered", profile.key))?
                    .as_count();
                let info = self.leaf_search(state, profile, SearchKind::Delivering)?;
                state.record(
                    &format!("{}_tracking", profile.key),
                    MetricValue::List(info.tracking),
                );
                MetricValue::Count(info.count.saturating_sub(delivered))
            }
            Metric::Packages(profile) => {
                let delivering = self
                    .resolve(state, &format!("{}_delivering", profile.key))?
                    .as_count();
                let delivered = self
                    .resolve(state, &format!("{}_delivered", profile.key))?
                    .as_count();
                MetricValue::Count(delivering + delivered)
            }
            Metric::TotalDelivered => {
                let mut total = 0;
                for carrier in &self.config.carriers {
                    total += self
                        .resolve(state, &format!("{}_delivered", carrier.key))?
                        .as_count();
                }
                total += self.resolve(state, "amazon_delivered")?.as_count();
                MetricValue::Count(total)
            }
            Metric::TotalTransit => {
                // Every configured carrier's delivered metric is a hard
                // dependency: the hand-off accumulator must be complete
                // before it is read
                for carrier in &self.config.carriers {
                    self.resolve(state, &format!("{}_delivered", carrier.key))?;
                }

                let mut total = 0;
                for carrier in &self.config.carriers {
                    total += self
                        .resolve(state, &format!("{}_delivering", carrier.key))?
                        .as_count();
                }

                // Amazon never names its shipper: assume at least as many in
                // transit as Amazon claims outstanding, minus packages other
                // carriers say they delivered on Amazon's behalf
                let amazon_packages = self.resolve(state, "amazon_packages")?.as_count();
                total = total
                    .max(amazon_packages)
                    .saturating_sub(state.delivered_by_other_carrier);
                MetricValue::Count(total)
            }
            Metric::Unknown => {
                log::debug!("Unknown sensor type: {name}");
                return Ok(MetricValue::Count(0));
            }
        };

        state.record(name, value.clone());
        log::debug!("Sensor: {name} value: {value:?}");
        Ok(value)
    }

    fn classify(&self, name: &str) -> Metric<'_> {
        match name {
            "mail_updated" => return Metric::MailUpdated,
            "amazon_packages" => return Metric::AmazonPackages,
            "amazon_order" => return Metric::AmazonOrder,
            "amazon_delivered" => return Metric::AmazonDelivered,
            "amazon_exception" | "amazon_exception_order" => return Metric::AmazonException,
            "zpackages_delivered" => return Metric::TotalDelivered,
            "zpackages_transit" => return Metric::TotalTransit,
            _ => {}
        }
        if let Some(profile) = name
            .strip_suffix("_delivered")
            .and_then(|prefix| self.config.carrier(prefix))
        {
            return Metric::Delivered(profile);
        }
        if let Some(profile) = name
            .strip_suffix("_delivering")
            .and_then(|prefix| self.config.carrier(prefix))
        {
            return Metric::Delivering(profile);
        }
        if let Some(profile) = name
            .strip_suffix("_packages")
            .and_then(|prefix| self.config.carrier(prefix))
        {
            return Metric::Packages(profile);
        }
        Metric::Unknown
    }

    /// Perform the subject searches for one carrier metric: message counting
    /// or body-phrase counting, tracking extraction for delivering searches,
    /// and the Amazon hand-off side effect for delivered searches.
    fn leaf_search(
        &self,
        state: &mut CycleState,
        profile: &CarrierProfile,
        kind: SearchKind,
    ) -> anyhow::Result<LeafResult> {
        let subjects = match kind {
            SearchKind::Delivered => &profile.delivered_subjects,
            SearchKind::Delivering => &profile.delivering_subjects,
        };

        let mut count = 0u32;
        let mut found_ids: Vec<MessageId> = Vec::new();

        for subject in subjects {
            log::debug!(
                "Attempting to find mail from ({:?}) with subject ({subject})",
                profile.addresses
            );
            let ids = self
                .client
                .search(&profile.addresses, state.today, Some(subject))?;

            match self.body_phrases.get(&profile.key) {
                Some(phrases) => {
                    count += self.find_text(&ids, phrases, profile.count_from_body)?;
                }
                None => count += ids.len() as u32,
            }

            if matches!(kind, SearchKind::Delivered) && !self.handoff.is_empty() {
                let mentions = self.count_messages_containing(&ids, &self.handoff)?;
                if mentions > 0 {
                    state.delivered_by_other_carrier += mentions;
                    log::debug!(
                        "Sensor: {}_delivered found {mentions} Amazon hand-off mention(s)",
                        profile.key
                    );
                }
            }

            found_ids.extend(ids);
        }

        let mut tracking = Vec::new();
        if matches!(kind, SearchKind::Delivering) && count > 0 {
            if let Some(pattern) = self.tracking.get(&profile.key) {
                tracking = extract_tracking(self.client, &found_ids, pattern)?;
                if !tracking.is_empty() {
                    // Tracking numbers are the more accurate count
                    count = tracking.len() as u32;
                }
            }
        }

        Ok(LeafResult { count, tracking })
    }

    /// Count phrase hits across the text parts of a message batch. With
    /// `count_from_body`, a phrase capture group supplies the count outright.
    fn find_text(
        &self,
        ids: &[MessageId],
        patterns: &[Regex],
        count_from_body: bool,
    ) -> anyhow::Result<u32> {
        let mut count = 0u32;
        for id in ids {
            let raw = self.client.fetch(id)?;
            let record = MessageRecord::parse(&raw);
            for part in record.text_parts() {
                for pattern in patterns {
                    if count_from_body {
                        if let Some(group) =
                            pattern.captures(&part.text).and_then(|caps| caps.get(1))
                        {
                            if let Ok(n) = group.as_str().parse::<u32>() {
                                log::debug!("Found body count {n} for pattern {pattern}");
                                count = n;
                                continue;
                            }
                        }
                    }
                    let hits = pattern.find_iter(&part.text).count() as u32;
                    if hits > 0 {
                        log::debug!("Found ({pattern}) in email {hits} time(s).");
                        count += hits;
                    }
                }
            }
        }
        Ok(count)
    }

    /// Number of messages whose body matches any of the given patterns.
    fn count_messages_containing(
        &self,
        ids: &[MessageId],
        patterns: &[Regex],
    ) -> anyhow::Result<u32> {
        let mut count = 0u32;
        for id in ids {
            let raw = self.client.fetch(id)?;
            let record = MessageRecord::parse(&raw);
            let matched = record
                .text_parts()
                .any(|part| patterns.iter().any(|p| p.is_match(&part.text)));
            if matched {
                count += 1;
            }
        }
        Ok(count)
    }
}
