//! Serde-Hilfe: `Vec<u8>` als Base64-String (Standard-Alphabet)
//!
//! ```rust,ignore
//! #[serde(with = "tresor_protocol::base64_serde")]
//! ciphertext: Vec<u8>,
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let text = String::deserialize(deserializer)?;
    STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Huelle {
        #[serde(with = "super")]
        daten: Vec<u8>,
    }

    #[test]
    fn kodiert_als_standard_base64() {
        let json = serde_json::to_string(&Huelle {
            daten: vec![0xFB, 0xFF, 0x00],
        })
        .unwrap();
        assert_eq!(json, r#"{"daten":"+/8A"}"#);
    }

    #[test]
    fn ungueltiges_base64_ist_fehler() {
        let result: Result<Huelle, _> = serde_json::from_str(r#"{"daten":"%%%"}"#);
        assert!(result.is_err());
    }
}
