//! Common types and utilities shared across models.

/// Enumerations stored as lowercase text columns.
pub trait TextEnum: Sized + Copy + 'static {
    /// Every variant, in declaration order
    fn all() -> &'static [Self];

    /// The stored text form
    fn as_str(&self) -> &'static str;

    /// Human readable list of accepted values, for validation messages
    fn expected() -> String {
        Self::all()
            .iter()
            .map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Declare an enum whose variants map one-to-one to stored text values.
///
/// Generates serde support, `Display`, `FromStr` (case-insensitive) and
/// [`TextEnum`].
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        $vis enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant ),+
        }

        impl $crate::db::TextEnum for $name {
            fn all() -> &'static [Self] {
                &[$($name::$variant),+]
            }

            fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str($crate::db::TextEnum::as_str(self))
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(format!("Unknown {}: {}", stringify!($name), s)),
                }
            }
        }
    };
}

text_enum! {
    /// Severity shared by rules and security threats
    pub enum Severity {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
}

impl Severity {
    /// Ordering weight (higher = more severe)
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        }
    }
}

text_enum! {
    /// Compliance frameworks used by attestations and audits
    pub enum Framework {
        Soc2 => "soc2",
        Iso27001 => "iso27001",
        Hipaa => "hipaa",
        Gdpr => "gdpr",
        PciDss => "pci_dss",
    }
}

/// Helper to parse a JSON array column, tolerating bad data
pub fn parse_string_list(json: &str) -> Vec<String> {
    serde_json::from_str(json).unwrap_or_default()
}

/// Helper to serialize a list for a JSON array column
pub fn serialize_string_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}
