use regex::Regex;

use crate::client::{MailClient, MailError, MessageId};
use crate::message::MessageRecord;

/// Compiled tracking-number pattern plus the per-carrier quirks that change
/// how matches are taken.
#[derive(Debug, Clone)]
pub struct TrackingPattern {
    pub regex: Regex,
    /// The matched text embeds the number in a longer label; keep only the
    /// token after the separator.
    pub compound: bool,
    /// Scan the entire raw message instead of individual text parts. Some
    /// carriers only carry the number in headers or attachment metadata.
    pub whole_message: bool,
}

impl TrackingPattern {
    pub fn new(pattern: &str, compound: bool, whole_message: bool) -> anyhow::Result<Self> {
        Ok(TrackingPattern {
            regex: Regex::new(pattern)?,
            compound,
            whole_message,
        })
    }

    /// First match in `text`: capture group 1 if the pattern has groups,
    /// otherwise the whole match.
    fn first_match(&self, text: &str) -> Option<String> {
        self.regex.captures(text).map(|caps| {
            caps.get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default()
        })
    }

    fn from_body_match(&self, text: &str) -> Option<String> {
        let mut found = self.first_match(text)?;
        if self.compound {
            if let Some((_, number)) = found.split_once(' ') {
                found = number.to_string();
            }
        }
        Some(found)
    }
}

/// Extract at most one tracking number per message, subject first, then body
/// parts. Returns a stable, first-seen-order list with no duplicates; a
/// message contributing nothing is not an error.
pub fn extract_tracking<C: MailClient>(
    client: &C,
    ids: &[MessageId],
    pattern: &TrackingPattern,
) -> Result<Vec<String>, MailError> {
    let mut tracking: Vec<String> = Vec::new();
    log::debug!("Searching for tracking numbers in {} message(s)...", ids.len());

    for id in ids {
        let raw = client.fetch(id)?;
        let record = MessageRecord::parse(&raw);

        // Subject wins over body
        if let Some(found) = pattern.first_match(&record.subject) {
            log::debug!("Found tracking number in email subject: {found}");
            push_unique(&mut tracking, found);
            continue;
        }

        if pattern.whole_message {
            if let Some(found) = pattern.from_body_match(&record.whole_text()) {
                log::debug!("Found tracking number in raw message: {found}");
                push_unique(&mut tracking, found);
            }
            continue;
        }

        for part in record.text_parts() {
            if let Some(found) = pattern.from_body_match(&part.text) {
                log::debug!("Found tracking number in email body: {found}");
                push_unique(&mut tracking, found);
                break;
            }
        }
    }

    if tracking.is_empty() {
        log::debug!("No tracking numbers found");
    }
    Ok(tracking)
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
    use chrono::NaiveDate;

    fn date() -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(2025, 3, 10)
    }

    #[test]
    fn test_subject_wins_over_body() {
        let client = MockMailClient::new(vec![MockMessage::new(
            "1",
            "mcinfo@ups.com",
            date(),
            "Delivered: 1Z9999W99999999999",
            "Body has a different number 1Z1111W11111111111",
        )]);
        let pattern = TrackingPattern::new(r"1Z?[0-9A-Z]{16}", false, false).unwrap();

        let found = extract_tracking(&client, &["1".to_string()], &pattern).unwrap();
        assert_eq!(found, vec!["1Z9999W99999999999".to_string()]);
    }

    #[test]
    fn test_deduplicates_across_messages_in_stable_order() {
        let client = MockMailClient::new(vec![
            MockMessage::new(
                "1",
                "fedexnotify@fedex.com",
                date(),
                "Your package is out for delivery",
                "Tracking: 123456789012",
            ),
            MockMessage::new(
                "2",
                "fedexnotify@fedex.com",
                date(),
                "Your package is out for delivery",
                "Tracking: 987654321098",
            ),
            MockMessage::new(
                "3",
                "fedexnotify@fedex.com",
                date(),
                "Reminder",
                "Tracking: 123456789012",
            ),
        ]);
        let pattern = TrackingPattern::new(r"\d{12,20}", false, false).unwrap();
        let ids: Vec<String> = vec!["1".into(), "2".into(), "3".into()];

        let first = extract_tracking(&client, &ids, &pattern).unwrap();
        assert_eq!(
            first,
            vec!["123456789012".to_string(), "987654321098".to_string()]
        );

        // Idempotent: same inputs, same ordered list
        let second = extract_tracking(&client, &ids, &pattern).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_compound_pattern_keeps_second_token() {
        let client = MockMailClient::new(vec![MockMessage::new(
            "1",
            "noreply@dhl.de",
            date(),
            "Ihr Paket kommt heute",
            "Ihre Sendung mit der number 1234567890 ist unterwegs",
        )]);
        let pattern = TrackingPattern::new(r"number \d{10,12}", true, false).unwrap();

        let found = extract_tracking(&client, &["1".to_string()], &pattern).unwrap();
        assert_eq!(found, vec!["1234567890".to_string()]);
    }

    #[test]
    fn test_whole_message_scan_reaches_outside_text_parts() {
        // Tracking number only appears in a header, not in any text part
        let raw = b"From: mcinfo@ups.com\r\nX-Shipment: 1Z9999W99999999999\r\nSubject: Update\r\nContent-Type: text/plain\r\n\r\nNo number here.".to_vec();
        let mut message = MockMessage::new("1", "mcinfo@ups.com", date(), "Update", "unused");
        message.raw = raw;
        let client = MockMailClient::new(vec![message]);
        let pattern = TrackingPattern::new(r"1Z?[0-9A-Z]{16}", false, true).unwrap();

        let found = extract_tracking(&client, &["1".to_string()], &pattern).unwrap();
        assert_eq!(found, vec!["1Z9999W99999999999".to_string()]);
    }

    #[test]
    fn test_no_matches_is_empty_not_error() {
        let client = MockMailClient::new(vec![MockMessage::new(
            "1",
            "auto-reply@usps.com",
            date(),
            "Item Delivered",
            "No numbers at all.",
        )]);
        let pattern = TrackingPattern::new(r"9[234]\d{15,22}", false, false).unwrap();

        let found = extract_tracking(&client, &["1".to_string()], &pattern).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_fetch_failure_propagates() {
        let client = MockMailClient::new(vec![]);
        let pattern = TrackingPattern::new(r"\d+", false, false).unwrap();
        let err = extract_tracking(&client, &["missing".to_string()], &pattern).unwrap_err();
        assert!(matches!(err, MailError::Fetch { .. }));
    }
}
