//! DICOM value representations and the index value types they map to.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Value representations supported by the index.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueRepresentation {
    AE,
    AS,
    AT,
    CS,
    DA,
    DS,
    DT,
    FD,
    FL,
    IS,
    LO,
    PN,
    SH,
    SL,
    SS,
    TM,
    UI,
    UL,
    US,
}

impl ValueRepresentation {
    /// All value representations accepted for extended query tags.
    pub const ALL: [ValueRepresentation; 19] = [
        Self::AE,
        Self::AS,
        Self::AT,
        Self::CS,
        Self::DA,
        Self::DS,
        Self::DT,
        Self::FD,
        Self::FL,
        Self::IS,
        Self::LO,
        Self::PN,
        Self::SH,
        Self::SL,
        Self::SS,
        Self::TM,
        Self::UI,
        Self::UL,
        Self::US,
    ];

    /// The two-letter code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AE => "AE",
            Self::AS => "AS",
            Self::AT => "AT",
            Self::CS => "CS",
            Self::DA => "DA",
            Self::DS => "DS",
            Self::DT => "DT",
            Self::FD => "FD",
            Self::FL => "FL",
            Self::IS => "IS",
            Self::LO => "LO",
            Self::PN => "PN",
            Self::SH => "SH",
            Self::SL => "SL",
            Self::SS => "SS",
            Self::TM => "TM",
            Self::UI => "UI",
            Self::UL => "UL",
            Self::US => "US",
        }
    }

    /// The index table family values of this VR are stored in.
    pub fn data_type(&self) -> ExtendedQueryTagDataType {
        match self {
            Self::AE | Self::AS | Self::CS | Self::LO | Self::SH | Self::TM | Self::UI => {
                ExtendedQueryTagDataType::String
            }
            Self::AT | Self::IS | Self::SL | Self::SS | Self::UL | Self::US => {
                ExtendedQueryTagDataType::Long
            }
            Self::DS | Self::FD | Self::FL => ExtendedQueryTagDataType::Double,
            Self::DA | Self::DT => ExtendedQueryTagDataType::DateTime,
            Self::PN => ExtendedQueryTagDataType::PersonName,
        }
    }

    /// Maximum string length of a single value, for string-encoded VRs.
    ///
    /// PN is limited per component group and is checked separately.
    pub fn max_length(&self) -> Option<usize> {
        match self {
            Self::AE => Some(16),
            Self::AS => Some(4),
            Self::CS => Some(16),
            Self::DA => Some(8),
            Self::DS => Some(16),
            Self::DT => Some(26),
            Self::IS => Some(12),
            Self::LO => Some(64),
            Self::SH => Some(16),
            Self::TM => Some(14),
            Self::UI => Some(64),
            _ => None,
        }
    }
}

impl fmt::Display for ValueRepresentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ValueRepresentation> for String {
    fn from(vr: ValueRepresentation) -> Self {
        vr.as_str().to_string()
    }
}

impl FromStr for ValueRepresentation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|vr| vr.as_str() == upper)
            .ok_or_else(|| format!("unsupported value representation: {}", s))
    }
}

/// Value type of an extended query tag; each maps to one index table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtendedQueryTagDataType {
    /// Short strings, codes and UIDs.
    String,
    /// Integers.
    Long,
    /// Floating point and decimal strings.
    Double,
    /// Dates and date-times.
    DateTime,
    /// Person names, with a searchable words column.
    PersonName,
}

impl fmt::Display for ExtendedQueryTagDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Long => "long",
            Self::Double => "double",
            Self::DateTime => "datetime",
            Self::PersonName => "personname",
        };
        f.write_str(name)
    }
}
