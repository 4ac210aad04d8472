use serde::Serialize;

use crate::error::{KEY_DELIMITER, ParseError};

/// A single telemetry reading for one sensor reference of one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub reference: String,
    pub value: f64,
    pub timestamp: u64,
}

impl Reading {
    pub fn new(reference: &str, value: f64, timestamp: u64) -> Self {
        Reading {
            reference: reference.to_string(),
            value,
            timestamp,
        }
    }
}

/// Builds the compound queue key `deviceKey+reference`. Components that
/// are empty or contain the delimiter are rejected rather than stored
/// under a key that would later decode into the wrong device.
pub fn encode_key(device_key: &str, reference: &str) -> Result<String, ParseError> {
    for component in [device_key, reference] {
        if component.is_empty() {
            return Err(ParseError::EmptyComponent);
        }
        if component.contains(KEY_DELIMITER) {
            return Err(ParseError::ReservedDelimiter(component.to_string()));
        }
    }
    Ok(format!("{device_key}{KEY_DELIMITER}{reference}"))
}

/// Splits a compound key back into `(deviceKey, reference)`.
pub fn decode_key(key: &str) -> Result<(String, String), ParseError> {
    let (device_key, reference) = key
        .split_once(KEY_DELIMITER)
        .ok_or_else(|| ParseError::MalformedKey(key.to_string()))?;
    if device_key.is_empty() || reference.is_empty() || reference.contains(KEY_DELIMITER) {
        return Err(ParseError::MalformedKey(key.to_string()));
    }
    Ok((device_key.to_string(), reference.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_round_trip() {
        let key = encode_key("DEV1", "presence").unwrap();
        assert_eq!(key, "DEV1+presence");
        assert_eq!(
            decode_key(&key).unwrap(),
            ("DEV1".to_string(), "presence".to_string())
        );
    }

    #[test]
    fn test_encode_rejects_delimiter() {
        assert!(matches!(
            encode_key("DEV+1", "presence"),
            Err(ParseError::ReservedDelimiter(_))
        ));
        assert!(matches!(
            encode_key("DEV1", "pres+ence"),
            Err(ParseError::ReservedDelimiter(_))
        ));
    }

    #[test]
    fn test_encode_rejects_empty_components() {
        assert!(encode_key("", "presence").is_err());
        assert!(encode_key("DEV1", "").is_err());
    }

    #[test]
    fn test_decode_rejects_malformed_keys() {
        assert!(decode_key("no-delimiter").is_err());
        assert!(decode_key("+presence").is_err());
        assert!(decode_key("DEV1+").is_err());
        assert!(decode_key("DEV1+a+b").is_err());
    }
}
