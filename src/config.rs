use regex::Regex;
use serde::{Deserialize, Serialize};

/// Per-carrier configuration. Loaded once at startup and shared across
/// evaluation cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarrierProfile {
    /// Short key used as the metric-name prefix ("ups" -> "ups_delivered").
    pub key: String,
    /// Sender addresses the carrier's notifications come from.
    pub addresses: Vec<String>,
    #[serde(default)]
    pub delivered_subjects: Vec<String>,
    #[serde(default)]
    pub delivering_subjects: Vec<String>,
    /// Optional tracking-number pattern. Group 1 wins when present.
    #[serde(default)]
    pub tracking_pattern: Option<String>,
    /// The pattern matches a label plus the number; keep the second token.
    #[serde(default)]
    pub compound_tracking: bool,
    /// Scan the entire raw message instead of individual text parts.
    #[serde(default)]
    pub whole_message: bool,
    /// Phrases searched in message bodies instead of counting messages.
    #[serde(default)]
    pub body_phrases: Vec<String>,
    /// A capture group in a body phrase yields the count directly
    /// ("You have (\d+) parcels arriving").
    #[serde(default)]
    pub count_from_body: bool,
}

/// Amazon-specific configuration: address construction, lookback window and
/// the phrase sets driving shipped/delivered/arriving classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmazonProfile {
    /// Base domain; expanded with `local_parts` to full search addresses.
    pub domain: String,
    /// User-forwarded addresses, searched verbatim.
    #[serde(default)]
    pub forwards: Vec<String>,
    /// Lookback window in days for order reconciliation.
    #[serde(default = "default_amazon_days")]
    pub days: u32,
    pub ordered_subjects: Vec<String>,
    pub delivered_subjects: Vec<String>,
    /// Subjects marking delivery-exception notices ("Delivery update:").
    #[serde(default = "default_exception_subjects")]
    pub exception_subjects: Vec<String>,
    /// Markers that introduce an arrival-date phrase in the body.
    pub arrival_markers: Vec<String>,
    /// Markers that terminate the arrival-date phrase window.
    pub arrival_end_markers: Vec<String>,
    /// Regexes tried first; group 1 of the first match is the arrival phrase.
    #[serde(default)]
    pub arrival_regexes: Vec<String>,
    #[serde(default = "default_order_pattern")]
    pub order_pattern: String,
    #[serde(default = "default_local_parts")]
    pub local_parts: Vec<String>,
}

fn default_amazon_days() -> u32 {
    3
}

fn default_exception_subjects() -> Vec<String> {
    vec!["Delivery update:".to_string()]
}

fn default_order_pattern() -> String {
    r"[0-9]{3}-[0-9]{7}-[0-9]{7}".to_string()
}

fn default_local_parts() -> Vec<String> {
    vec![
        "shipment-tracking".to_string(),
        "order-update".to_string(),
        "update-order".to_string(),
        "conferma-spedizione".to_string(),
        "versandbestaetigung".to_string(),
    ]
}

impl AmazonProfile {
    /// Full address list to search: forwards first (normalized), then either
    /// verbatim addresses or the configured local parts at each domain.
    pub fn search_addresses(&self) -> Vec<String> {
        let mut sources: Vec<String> = Vec::new();
        for fwd in &self.forwards {
            for entry in fwd.split_whitespace() {
                if !entry.is_empty() && entry != "\"\"" && !sources.contains(&entry.to_string()) {
                    sources.push(entry.to_string());
                }
            }
        }
        sources.extend(self.domain.split_whitespace().map(|s| s.to_string()));

        let mut addresses = Vec::new();
        for source in sources {
            if source.contains('@') {
                addresses.push(source.trim_matches('"').to_string());
            } else {
                for part in &self.local_parts {
                    addresses.push(format!("{part}@{source}"));
                }
            }
        }
        log::debug!("Amazon email search addresses: {addresses:?}");
        addresses
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub carriers: Vec<CarrierProfile>,
    pub amazon: AmazonProfile,
    /// Phrases inside a non-Amazon delivered email marking the package as an
    /// Amazon hand-off.
    #[serde(default = "default_handoff_phrases")]
    pub handoff_phrases: Vec<String>,
    /// Metrics requested each cycle when the caller does not specify a list.
    #[serde(default)]
    pub resources: Vec<String>,
}

fn default_handoff_phrases() -> Vec<String> {
    vec![
        "(?i)on behalf of amazon".to_string(),
        "(?i)amazon order".to_string(),
    ]
}

impl Default for Config {
    fn default() -> Self {
        let carriers = vec![
            CarrierProfile {
                key: "usps".to_string(),
                addresses: vec!["auto-reply@usps.com".to_string()],
                delivered_subjects: vec!["Item Delivered".to_string()],
                delivering_subjects: vec![
                    "Expected Delivery on".to_string(),
                    "Out for Delivery".to_string(),
                ],
                tracking_pattern: Some(r"9[234]\d{15,22}".to_string()),
                compound_tracking: false,
                whole_message: false,
                body_phrases: Vec::new(),
                count_from_body: false,
            },
            CarrierProfile {
                key: "ups".to_string(),
                addresses: vec!["mcinfo@ups.com".to_string()],
                delivered_subjects: vec![
                    "Your UPS Package was delivered".to_string(),
                    "Your UPS Packages were delivered".to_string(),
                ],
                delivering_subjects: vec![
                    "UPS Update: Package Scheduled for Delivery Today".to_string(),
                    "UPS Update: Follow Your Delivery on a Live Map".to_string(),
                ],
                tracking_pattern: Some(r"1Z?[0-9A-Z]{16}".to_string()),
                compound_tracking: false,
                // UPS puts the tracking number outside the text parts
                whole_message: true,
                body_phrases: Vec::new(),
                count_from_body: false,
            },
            CarrierProfile {
                key: "fedex".to_string(),
                addresses: vec![
                    "TrackingUpdates@fedex.com".to_string(),
                    "fedexnotify@fedex.com".to_string(),
                ],
                delivered_subjects: vec!["Your package has been delivered".to_string()],
                delivering_subjects: vec![
                    "Delivery scheduled for today".to_string(),
                    "Your package is scheduled for delivery today".to_string(),
                    "Your package is now out for delivery".to_string(),
                ],
                tracking_pattern: Some(r"\d{12,20}".to_string()),
                compound_tracking: false,
                whole_message: false,
                body_phrases: Vec::new(),
                count_from_body: false,
            },
            CarrierProfile {
                key: "dhl".to_string(),
                addresses: vec![
                    "NoReply.ODD@dhl.com".to_string(),
                    "noreply@dhl.de".to_string(),
                ],
                delivered_subjects: vec!["ist zugestellt".to_string()],
                delivering_subjects: vec![
                    "DHL On Demand Delivery".to_string(),
                    "kommt heute".to_string(),
                ],
                tracking_pattern: Some(r"number \d{10,12}".to_string()),
                compound_tracking: true,
                whole_message: false,
                body_phrases: Vec::new(),
                count_from_body: false,
            },
            CarrierProfile {
                key: "capost".to_string(),
                addresses: vec!["donotreply@canadapost.postescanada.ca".to_string()],
                delivered_subjects: vec!["Delivery Notification".to_string()],
                delivering_subjects: vec!["arriving today".to_string()],
                tracking_pattern: None,
                compound_tracking: false,
                whole_message: false,
                body_phrases: vec![r"You have (\d+) parcels? arriving".to_string()],
                count_from_body: true,
            },
        ];

        let amazon = AmazonProfile {
            domain: "amazon.com".to_string(),
            forwards: Vec::new(),
            days: default_amazon_days(),
            ordered_subjects: vec!["Ordered:".to_string(), "Your order of".to_string()],
            delivered_subjects: vec![
                "Delivered:".to_string(),
                "Your package was delivered".to_string(),
                "has been delivered".to_string(),
            ],
            exception_subjects: default_exception_subjects(),
            arrival_markers: vec![
                "will arrive".to_string(),
                "estimated delivery date is".to_string(),
                "guaranteed delivery date is".to_string(),
                "Arriving".to_string(),
                "arriving".to_string(),
                "Now arriving".to_string(),
            ],
            arrival_end_markers: vec![
                "Previously expected:".to_string(),
                "Track your".to_string(),
                "Per your request".to_string(),
                "Why tracking".to_string(),
            ],
            arrival_regexes: vec![
                r"[Aa]rriving:?\s*([A-Za-z]+,?\s+[A-Za-z]+\s+[0-9]{1,2})".to_string(),
                r"[Nn]ow expected:?\s*([A-Za-z]+,?\s+[A-Za-z]+\s+[0-9]{1,2})".to_string(),
            ],
            order_pattern: default_order_pattern(),
            local_parts: default_local_parts(),
        };

        let mut resources = vec!["mail_updated".to_string()];
        for carrier in &carriers {
            resources.push(format!("{}_delivered", carrier.key));
            resources.push(format!("{}_delivering", carrier.key));
            resources.push(format!("{}_packages", carrier.key));
        }
        resources.extend([
            "amazon_packages".to_string(),
            "amazon_order".to_string(),
            "amazon_delivered".to_string(),
            "amazon_exception".to_string(),
            "zpackages_delivered".to_string(),
            "zpackages_transit".to_string(),
        ]);

        Config {
            carriers,
            amazon,
            handoff_phrases: default_handoff_phrases(),
            resources,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn carrier(&self, key: &str) -> Option<&CarrierProfile> {
        self.carriers.iter().find(|c| c.key == key)
    }

    /// Compile every configured pattern, reporting the first bad one. Run by
    /// --test-config and again implicitly at engine construction.
    pub fn validate(&self) -> anyhow::Result<()> {
        for carrier in &self.carriers {
            if let Some(pattern) = &carrier.tracking_pattern {
                Regex::new(pattern).map_err(|e| {
                    anyhow::anyhow!("carrier {}: bad tracking pattern: {e}", carrier.key)
                })?;
            }
            for phrase in &carrier.body_phrases {
                Regex::new(phrase).map_err(|e| {
                    anyhow::anyhow!("carrier {}: bad body phrase: {e}", carrier.key)
                })?;
            }
        }
        for phrase in &self.handoff_phrases {
            Regex::new(phrase).map_err(|e| anyhow::anyhow!("bad handoff phrase: {e}"))?;
        }
        for pattern in &self.amazon.arrival_regexes {
            Regex::new(pattern).map_err(|e| anyhow::anyhow!("bad arrival regex: {e}"))?;
        }
        Regex::new(&self.amazon.order_pattern)
            .map_err(|e| anyhow::anyhow!("bad order pattern: {e}"))?;
        Ok(())
    }
}
