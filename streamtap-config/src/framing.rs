//! Bundle header layout.
//!
//! Offsets are byte positions inside the header; multi-byte fields are
//! little-endian. Magics are hex strings.

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

use crate::error::ConfigError;
use crate::validation;

#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq, Eq)]
pub struct FramingConfig {
    #[validate(custom(function = validation::validate_magics))]
    #[serde(default = "default_magics")]
    pub magics: Vec<String>,

    #[validate(range(min = 1, max = 1024))]
    #[serde(default = "default_header_len")]
    pub header_len: usize,

    #[serde(default = "default_total_len_offset")]
    pub total_len_offset: usize,

    #[serde(default = "default_message_count_offset")]
    pub message_count_offset: usize,

    #[serde(default = "default_compression_offset")]
    pub compression_offset: usize,

    #[serde(default = "default_decompressed_len_offset")]
    pub decompressed_len_offset: usize,

    #[serde(default = "default_true")]
    pub length_prefixed: bool,

    /// Frames declaring a larger size are treated as corrupt.
    #[validate(range(min = 64, max = 268435456))]
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

fn default_magics() -> Vec<String> {
    vec![
        "5252a041ff5d46e27f2a644d7b99c475".into(),
        "00000000000000000000000000000000".into(),
    ]
}
fn default_header_len() -> usize {
    40
}
fn default_total_len_offset() -> usize {
    24
}
fn default_message_count_offset() -> usize {
    30
}
fn default_compression_offset() -> usize {
    33
}
fn default_decompressed_len_offset() -> usize {
    36
}
fn default_true() -> bool {
    true
}
fn default_max_frame_len() -> usize {
    1 << 20
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            magics: default_magics(),
            header_len: default_header_len(),
            total_len_offset: default_total_len_offset(),
            message_count_offset: default_message_count_offset(),
            compression_offset: default_compression_offset(),
            decompressed_len_offset: default_decompressed_len_offset(),
            length_prefixed: default_true(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

impl FramingConfig {
    pub fn magic_bytes(&self) -> Result<Vec<Vec<u8>>, ConfigError> {
        self.magics
            .iter()
            .map(|magic| {
                hex::decode(magic).map_err(|e| ConfigError::InvalidValue {
                    field: "framing.magics",
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    /// Checks that every field fits inside the header.
    pub fn check_layout(&self) -> Result<(), ConfigError> {
        let magic_len = self.magic_bytes()?.first().map_or(0, Vec::len);
        let fields = [
            ("framing.magics", 0, magic_len),
            ("framing.total_len_offset", self.total_len_offset, 4),
            ("framing.message_count_offset", self.message_count_offset, 2),
            ("framing.compression_offset", self.compression_offset, 1),
            ("framing.decompressed_len_offset", self.decompressed_len_offset, 4),
        ];
        for (field, offset, width) in fields {
            if offset + width > self.header_len {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!(
                        "{width} bytes at offset {offset} exceed header length {}",
                        self.header_len
                    ),
                });
            }
        }
        if self.max_frame_len < self.header_len {
            return Err(ConfigError::InvalidValue {
                field: "framing.max_frame_len",
                reason: "smaller than the header".into(),
            });
        }
        Ok(())
    }
}
