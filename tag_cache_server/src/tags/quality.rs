use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Individual reasons for a tag being invalid.
///
/// Codes 1 to 7 are reported by data acquisition; the rest are stamped by the server.
/// Code 0 on the DAQ side means OK and maps to no flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityFlag {
    OutOfBounds,
    ValueCorrupted,
    ConversionError,
    DataUnavailable,
    Unknown,
    UnsupportedType,
    IncorrectNativeAddress,
    ProcessInaccessible,
    EquipmentInaccessible,
    SubequipmentInaccessible,
    Uninitialised,
    UndefinedTag,
}

impl QualityFlag {
    pub const ALL: [QualityFlag; 12] = [
        QualityFlag::OutOfBounds,
        QualityFlag::ValueCorrupted,
        QualityFlag::ConversionError,
        QualityFlag::DataUnavailable,
        QualityFlag::Unknown,
        QualityFlag::UnsupportedType,
        QualityFlag::IncorrectNativeAddress,
        QualityFlag::ProcessInaccessible,
        QualityFlag::EquipmentInaccessible,
        QualityFlag::SubequipmentInaccessible,
        QualityFlag::Uninitialised,
        QualityFlag::UndefinedTag,
    ];

    pub fn code(self) -> u8 {
        match self {
            QualityFlag::OutOfBounds => 1,
            QualityFlag::ValueCorrupted => 2,
            QualityFlag::ConversionError => 3,
            QualityFlag::DataUnavailable => 4,
            QualityFlag::Unknown => 5,
            QualityFlag::UnsupportedType => 6,
            QualityFlag::IncorrectNativeAddress => 7,
            QualityFlag::ProcessInaccessible => 8,
            QualityFlag::EquipmentInaccessible => 9,
            QualityFlag::SubequipmentInaccessible => 10,
            QualityFlag::Uninitialised => 11,
            QualityFlag::UndefinedTag => 12,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|flag| flag.code() == code)
    }

    /// Flag for a DAQ quality code. `0` (OK) and server-side codes yield `None`.
    pub fn from_daq_code(code: u8) -> Option<Self> {
        Self::from_code(code).filter(|flag| flag.is_daq())
    }

    pub fn is_daq(self) -> bool {
        (1..=7).contains(&self.code())
    }

    /// Set and cleared by supervision only.
    pub fn is_supervision(self) -> bool {
        matches!(
            self,
            QualityFlag::ProcessInaccessible
                | QualityFlag::EquipmentInaccessible
                | QualityFlag::SubequipmentInaccessible
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QualityFlag::OutOfBounds => "OUT_OF_BOUNDS",
            QualityFlag::ValueCorrupted => "VALUE_CORRUPTED",
            QualityFlag::ConversionError => "CONVERSION_ERROR",
            QualityFlag::DataUnavailable => "DATA_UNAVAILABLE",
            QualityFlag::Unknown => "UNKNOWN",
            QualityFlag::UnsupportedType => "UNSUPPORTED_TYPE",
            QualityFlag::IncorrectNativeAddress => "INCORRECT_NATIVE_ADDRESS",
            QualityFlag::ProcessInaccessible => "PROCESS_INACCESSIBLE",
            QualityFlag::EquipmentInaccessible => "EQUIPMENT_INACCESSIBLE",
            QualityFlag::SubequipmentInaccessible => "SUBEQUIPMENT_INACCESSIBLE",
            QualityFlag::Uninitialised => "UNINITIALISED",
            QualityFlag::UndefinedTag => "UNDEFINED_TAG",
        }
    }
}

impl fmt::Display for QualityFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validity of a tag: the set of invalidity flags, each with its own description.
/// Valid iff no flag is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagQuality {
    invalid: BTreeMap<QualityFlag, String>,
}

impl TagQuality {
    pub fn valid() -> Self {
        TagQuality::default()
    }

    pub fn uninitialised() -> Self {
        let mut quality = TagQuality::default();
        quality.add(QualityFlag::Uninitialised, "Tag has not received a value yet");
        quality
    }

    pub fn is_valid(&self) -> bool {
        self.invalid.is_empty()
    }

    pub fn is_set(&self, flag: QualityFlag) -> bool {
        self.invalid.contains_key(&flag)
    }

    /// Returns `true` if the flag or its description changed.
    pub fn add(&mut self, flag: QualityFlag, description: impl Into<String>) -> bool {
        let description = description.into();
        match self.invalid.insert(flag, description.clone()) {
            Some(previous) => previous != description,
            None => true,
        }
    }

    pub fn remove(&mut self, flag: QualityFlag) -> bool {
        self.invalid.remove(&flag).is_some()
    }

    /// Drops every flag a new DAQ value supersedes. Supervision flags survive.
    pub fn clear_value_flags(&mut self) {
        self.invalid.retain(|flag, _| flag.is_supervision());
    }

    pub fn flags(&self) -> impl Iterator<Item = QualityFlag> + '_ {
        self.invalid.keys().copied()
    }

    pub fn flag_description(&self, flag: QualityFlag) -> Option<&str> {
        self.invalid.get(&flag).map(String::as_str)
    }

    /// Bit `1 << code` for every set flag. `0` means OK.
    pub fn bits(&self) -> u32 {
        self.invalid
            .keys()
            .fold(0u32, |bits, flag| bits | (1u32 << flag.code()))
    }

    pub fn description(&self) -> String {
        self.invalid
            .iter()
            .map(|(flag, text)| {
                if text.is_empty() {
                    flag.to_string()
                } else {
                    format!("{}: {}", flag, text)
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl fmt::Display for TagQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            f.write_str("OK")
        } else {
            f.write_str(&self.description())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daq_codes_map_to_flags() {
        assert_eq!(QualityFlag::from_daq_code(0), None);
        assert_eq!(QualityFlag::from_daq_code(1), Some(QualityFlag::OutOfBounds));
        assert_eq!(
            QualityFlag::from_daq_code(7),
            Some(QualityFlag::IncorrectNativeAddress)
        );
        assert_eq!(QualityFlag::from_daq_code(8), None);
    }

    #[test]
    fn value_flags_cleared_supervision_kept() {
        let mut quality = TagQuality::uninitialised();
        quality.add(QualityFlag::OutOfBounds, "150 > 100");
        quality.add(QualityFlag::ProcessInaccessible, "P1 down");

        quality.clear_value_flags();

        assert!(!quality.is_valid());
        assert_eq!(quality.flags().collect::<Vec<_>>(), vec![QualityFlag::ProcessInaccessible]);
        assert_eq!(quality.bits(), 1 << 8);
    }
}
