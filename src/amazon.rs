use chrono::{Duration, NaiveDate};
use regex::Regex;

use crate::client::{MailClient, MailError, MessageId};
use crate::config::AmazonProfile;
use crate::dates::parse_relative_date;
use crate::extract::{extract_tracking, TrackingPattern};
use crate::message::MessageRecord;

/// Placeholder recorded for an arriving-today message that carried no order
/// number anywhere.
const UNKNOWN_ORDER: &str = "Amazon Order";

/// Outcome of one reconciliation pass over the lookback window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmazonSummary {
    /// Conservative arriving-today count: min of the date signal and the
    /// distinct order-number signal.
    pub arriving_today: u32,
    /// All distinct order numbers of shipped, not-yet-delivered orders,
    /// first-seen order.
    pub order_numbers: Vec<String>,
}

/// Delivery-exception notices seen today and the orders they reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionSummary {
    pub count: u32,
    pub order_numbers: Vec<String>,
}

/// Classifies Amazon messages as ordered / shipped / delivered and turns the
/// free-text arrival phrasing into an arriving-today estimate.
pub struct AmazonReconciler<'a> {
    profile: &'a AmazonProfile,
    order_pattern: Regex,
    order_extractor: TrackingPattern,
    arrival_regexes: Vec<Regex>,
}

impl<'a> AmazonReconciler<'a> {
    pub fn new(profile: &'a AmazonProfile) -> anyhow::Result<Self> {
        let order_pattern = Regex::new(&profile.order_pattern)?;
        let order_extractor = TrackingPattern::new(&profile.order_pattern, false, false)?;
        let arrival_regexes = profile
            .arrival_regexes
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AmazonReconciler {
            profile,
            order_pattern,
            order_extractor,
            arrival_regexes,
        })
    }

    /// Walk every Amazon message in the lookback window, classify it, and
    /// reduce the noisy signals to one count and one order list.
    pub fn reconcile<C: MailClient>(
        &self,
        client: &C,
        today: NaiveDate,
    ) -> Result<AmazonSummary, MailError> {
        let since = today - Duration::days(i64::from(self.profile.days));
        let addresses = self.profile.search_addresses();
        let ids = client.search(&addresses, since, None)?;
        log::debug!("Amazon emails found: {}", ids.len());

        let mut order_numbers: Vec<String> = Vec::new();
        let mut delivered_orders: Vec<String> = Vec::new();
        let mut deliveries_today: Vec<String> = Vec::new();

        for id in &ids {
            let raw = client.fetch(id)?;
            let record = MessageRecord::parse(&raw);
            let subject_lower = record.subject.to_lowercase();
            log::debug!("Amazon subject: {}", record.subject);

            // Ordered but not yet shipped: counts nowhere
            if self.matches_any(&subject_lower, &self.profile.ordered_subjects) {
                log::debug!("Ordered email found, skipping.");
                continue;
            }

            // Delivered: remember its order numbers so they cannot also count
            // as arriving today
            if self.matches_any(&subject_lower, &self.profile.delivered_subjects) {
                let mut matched = false;
                for m in self.order_pattern.find_iter(&record.subject) {
                    matched = true;
                    push_unique(&mut delivered_orders, m.as_str().to_string());
                }
                if !matched {
                    log::debug!("Delivered email found, but no order number matched.");
                }
                continue;
            }

            // Shipped / in progress: order number from the subject, else the body
            let body = record.body_text();
            let message_order = self
                .order_pattern
                .find(&record.subject)
                .or_else(|| self.order_pattern.find(&body))
                .map(|m| m.as_str().to_string());
            if let Some(order) = &message_order {
                push_unique(&mut order_numbers, order.clone());
            }

            let Some(phrase) = self.arrival_phrase(&body) else {
                continue;
            };
            log::debug!("Arrival phrase: {phrase}");

            // Resolve relative to the message's own date; the comparison
            // against today discards stale signals
            let anchor = record.date.unwrap_or(today);
            match parse_relative_date(&phrase, anchor) {
                Some(date) if date == today => {
                    deliveries_today
                        .push(message_order.unwrap_or_else(|| UNKNOWN_ORDER.to_string()));
                }
                Some(date) => log::debug!("Delivery date not today: {date}"),
                None => log::debug!("Unparseable arrival phrase: {phrase}"),
            }
        }

        // Already-delivered orders must not also count as arriving today
        deliveries_today.retain(|order| !delivered_orders.contains(order));

        let arriving_today = deliveries_today.len().min(order_numbers.len()) as u32;
        log::debug!(
            "Amazon arriving today: {} (dates: {}, orders: {})",
            arriving_today,
            deliveries_today.len(),
            order_numbers.len()
        );
        Ok(AmazonSummary {
            arriving_today,
            order_numbers,
        })
    }

    /// Count of delivered-subject matches today, independent of the
    /// shipped/ordered reconciliation.
    pub fn delivered_count<C: MailClient>(
        &self,
        client: &C,
        today: NaiveDate,
    ) -> Result<u32, MailError> {
        let addresses = self.profile.search_addresses();
        let mut count = 0u32;
        for subject in &self.profile.delivered_subjects {
            let ids = client.search(&addresses, today, Some(subject))?;
            log::debug!(
                "Amazon delivered email(s) found for subject '{}': {}",
                subject,
                ids.len()
            );
            count += ids.len() as u32;
        }
        Ok(count)
    }

    /// Count delivery-exception notices received today and collect the order
    /// numbers they mention, subject first, then body.
    pub fn exceptions<C: MailClient>(
        &self,
        client: &C,
        today: NaiveDate,
    ) -> Result<ExceptionSummary, MailError> {
        let addresses = self.profile.search_addresses();
        let mut count = 0u32;
        let mut ids: Vec<MessageId> = Vec::new();

        for subject in &self.profile.exception_subjects {
            let found = client.search(&addresses, today, Some(subject))?;
            count += found.len() as u32;
            ids.extend(found);
        }
        log::debug!("Found {count} Amazon exception(s)");

        let order_numbers = extract_tracking(client, &ids, &self.order_extractor)?;
        Ok(ExceptionSummary {
            count,
            order_numbers,
        })
    }

    fn matches_any(&self, subject_lower: &str, phrases: &[String]) -> bool {
        phrases
            .iter()
            .any(|p| subject_lower.contains(&p.to_lowercase()))
    }

    /// Locate the raw arrival phrase: the window after the first marker
    /// present, else group 1 of the first arrival regex that matches.
    fn arrival_phrase(&self, body: &str) -> Option<String> {
        for marker in &self.profile.arrival_markers {
            let Some(pos) = body.find(marker.as_str()) else {
                continue;
            };
            let rest = &body[pos + marker.len()..];
            let end = self
                .profile
                .arrival_end_markers
                .iter()
                .filter_map(|m| rest.find(m.as_str()))
                .min()
                .unwrap_or(rest.len());
            let window = rest[..end].replace('>', " ");
            let phrase = window
                .trim_start_matches(|c: char| c == ':' || c.is_whitespace())
                .split_whitespace()
                .take(3)
                .collect::<Vec<_>>()
                .join(" ");
            if !phrase.is_empty() {
                return Some(phrase);
            }
        }

        for regex in &self.arrival_regexes {
            if let Some(group) = regex.captures(body).and_then(|caps| caps.get(1)) {
                return Some(group.as_str().to_string());
            }
        }
        None
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{MockMailClient, MockMessage};
    use crate::config::Config;

    const ORDER: &str = "123-4567890-1234567";

    fn today() -> NaiveDate {
        // A Monday
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    fn amazon_message(id: &str, date: NaiveDate, subject: &str, body: &str) -> MockMessage {
        MockMessage::new(id, "shipment-tracking@amazon.com", Some(date), subject, body)
    }

    fn reconcile(messages: Vec<MockMessage>) -> AmazonSummary {
        let config = Config::default();
        let client = MockMailClient::new(messages);
        let reconciler = AmazonReconciler::new(&config.amazon).unwrap();
        reconciler.reconcile(&client, today()).unwrap()
    }

    #[test]
    fn test_ordered_email_counts_nowhere() {
        let summary = reconcile(vec![amazon_message(
            "1",
            today(),
            "Ordered: Widget",
            &format!("Your order {ORDER} will arrive: Monday, March 10"),
        )]);
        assert_eq!(summary.arriving_today, 0);
        assert!(summary.order_numbers.is_empty());
    }

    #[test]
    fn test_shipped_arriving_today_counts() {
        let summary = reconcile(vec![amazon_message(
            "1",
            today(),
            "Shipped: Widget",
            &format!("Order {ORDER} Arriving: today Track your package"),
        )]);
        assert_eq!(summary.arriving_today, 1);
        assert_eq!(summary.order_numbers, vec![ORDER.to_string()]);
    }

    #[test]
    fn test_delivered_order_excluded_from_arriving_today() {
        let summary = reconcile(vec![
            amazon_message(
                "1",
                today(),
                "Shipped: Widget",
                &format!("Order {ORDER} Arriving: today Track your package"),
            ),
            amazon_message("2", today(), &format!("Delivered: your order {ORDER}"), "Enjoy!"),
        ]);
        assert_eq!(summary.arriving_today, 0);
        // The order itself is still reported as seen
        assert_eq!(summary.order_numbers, vec![ORDER.to_string()]);
    }

    #[test]
    fn test_weekday_phrase_resolves_against_message_date() {
        // Sent Saturday, arriving "Monday" -> resolves to today (Monday)
        let sent = NaiveDate::from_ymd_opt(2025, 3, 8).unwrap();
        let summary = reconcile(vec![amazon_message(
            "1",
            sent,
            "Shipped: Widget",
            &format!("Order {ORDER} arriving Monday Track your package"),
        )]);
        assert_eq!(summary.arriving_today, 1);
    }

    #[test]
    fn test_stale_weekday_phrase_is_discarded() {
        // Sent Saturday, "Sunday" resolved against the message date is
        // before today (Monday) -> no arriving-today signal; the message is
        // still inside the 3-day lookback window
        let sent = NaiveDate::from_ymd_opt(2025, 3, 8).unwrap();
        let summary = reconcile(vec![amazon_message(
            "1",
            sent,
            "Shipped: Widget",
            &format!("Order {ORDER} arriving Sunday Track your package"),
        )]);
        assert_eq!(summary.arriving_today, 0);
        assert_eq!(summary.order_numbers, vec![ORDER.to_string()]);
    }

    #[test]
    fn test_order_number_from_body_when_subject_lacks_one() {
        let summary = reconcile(vec![amazon_message(
            "1",
            today(),
            "Shipped: Widget",
            &format!("Order number {ORDER} is on the way. Arriving: tomorrow"),
        )]);
        assert_eq!(summary.order_numbers, vec![ORDER.to_string()]);
        assert_eq!(summary.arriving_today, 0);
    }

    #[test]
    fn test_missing_order_number_uses_placeholder_and_min_rule() {
        // Date signal says one package arrives today, but no order number was
        // ever seen: the conservative count is 0
        let summary = reconcile(vec![amazon_message(
            "1",
            today(),
            "Shipped: Widget",
            "Your package is Arriving: today Track your package",
        )]);
        assert_eq!(summary.arriving_today, 0);
        assert!(summary.order_numbers.is_empty());
    }

    #[test]
    fn test_unparseable_arrival_phrase_is_skipped() {
        let summary = reconcile(vec![amazon_message(
            "1",
            today(),
            "Shipped: Widget",
            &format!("Order {ORDER} will arrive shortly we promise"),
        )]);
        assert_eq!(summary.arriving_today, 0);
        assert_eq!(summary.order_numbers, vec![ORDER.to_string()]);
    }

    #[test]
    fn test_delivered_count_sums_subject_matches() {
        let config = Config::default();
        let client = MockMailClient::new(vec![
            amazon_message("1", today(), "Delivered: Widget", "done"),
            amazon_message("2", today(), "Delivered: Gadget", "done"),
        ]);
        let reconciler = AmazonReconciler::new(&config.amazon).unwrap();
        assert_eq!(reconciler.delivered_count(&client, today()).unwrap(), 2);
    }

    #[test]
    fn test_exception_notices_counted_with_orders() {
        let config = Config::default();
        let client = MockMailClient::new(vec![
            amazon_message(
                "1",
                today(),
                "Delivery update: your package is running late",
                &format!("Order {ORDER} has a new delivery estimate."),
            ),
            amazon_message("2", today(), "Shipped: Widget", "On the way."),
        ]);
        let reconciler = AmazonReconciler::new(&config.amazon).unwrap();

        let summary = reconciler.exceptions(&client, today()).unwrap();
        assert_eq!(summary.count, 1);
        assert_eq!(summary.order_numbers, vec![ORDER.to_string()]);
    }

    #[test]
    fn test_search_failure_propagates() {
        let config = Config::default();
        let client =
            MockMailClient::new(vec![]).failing_for("shipment-tracking@amazon.com");
        let reconciler = AmazonReconciler::new(&config.amazon).unwrap();
        assert!(reconciler.reconcile(&client, today()).is_err());
    }
}
