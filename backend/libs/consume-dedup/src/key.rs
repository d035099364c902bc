//! Dedup key derivation.
//!
//! The default key is the producer-assigned unique id of a message, falling
//! back to the id the broker assigned on delivery. Hosts with a different
//! notion of identity inject their own function through [`KeyExtractor::new`].

use std::fmt;
use std::sync::Arc;

use crate::error::{DedupError, DedupResult};

/// Maximum dedup key length in bytes
pub const MAX_KEY_LEN: usize = 255;

/// Identity accessors a delivered message exposes to the guard
pub trait DedupMessage {
    /// Identifier assigned by the producing client, if any
    fn unique_id(&self) -> Option<&str>;

    /// Identifier assigned by the broker for this delivery
    fn delivery_id(&self) -> Option<&str>;
}

/// Default key: client-assigned unique id, else the delivery id
pub fn default_message_key<M: DedupMessage + ?Sized>(message: &M) -> Option<String> {
    message
        .unique_id()
        .filter(|id| !id.is_empty())
        .or_else(|| message.delivery_id().filter(|id| !id.is_empty()))
        .map(str::to_string)
}

/// Injectable `(message) -> key` function
pub struct KeyExtractor<M: ?Sized> {
    extract: Arc<dyn Fn(&M) -> Option<String> + Send + Sync>,
}

impl<M: ?Sized> KeyExtractor<M> {
    /// Use a custom key derivation
    pub fn new<F>(extract: F) -> Self
    where
        F: Fn(&M) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            extract: Arc::new(extract),
        }
    }

    /// Derive and validate the key for `message`
    ///
    /// # Errors
    ///
    /// - `DedupError::MissingKey` if no key can be derived
    /// - `DedupError::InvalidKey` if the derived key is too long
    pub fn key_for(&self, message: &M) -> DedupResult<String> {
        let key = (self.extract)(message).ok_or(DedupError::MissingKey)?;
        validate_key(&key)?;
        Ok(key)
    }
}

impl<M: DedupMessage + ?Sized + 'static> Default for KeyExtractor<M> {
    fn default() -> Self {
        Self::new(default_message_key::<M>)
    }
}

impl<M: ?Sized> Clone for KeyExtractor<M> {
    fn clone(&self) -> Self {
        Self {
            extract: Arc::clone(&self.extract),
        }
    }
}

impl<M: ?Sized> fmt::Debug for KeyExtractor<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExtractor").finish_non_exhaustive()
    }
}

/// Validate dedup key format
pub fn validate_key(key: &str) -> DedupResult<()> {
    if key.is_empty() {
        return Err(DedupError::InvalidKey(
            "Dedup key cannot be empty".to_string(),
        ));
    }

    if key.len() > MAX_KEY_LEN {
        return Err(DedupError::InvalidKey(format!(
            "Dedup key too long: {} bytes (max {})",
            key.len(),
            MAX_KEY_LEN
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Delivery {
        uniq_id: Option<String>,
        msg_id: Option<String>,
        topic: String,
    }

    impl DedupMessage for Delivery {
        fn unique_id(&self) -> Option<&str> {
            self.uniq_id.as_deref()
        }

        fn delivery_id(&self) -> Option<&str> {
            self.msg_id.as_deref()
        }
    }

    fn delivery(uniq_id: Option<&str>, msg_id: Option<&str>) -> Delivery {
        Delivery {
            uniq_id: uniq_id.map(str::to_string),
            msg_id: msg_id.map(str::to_string),
            topic: "orders".to_string(),
        }
    }

    #[test]
    fn test_default_prefers_unique_id() {
        let extractor = KeyExtractor::<Delivery>::default();
        let key = extractor.key_for(&delivery(Some("uniq-1"), Some("msg-1"))).unwrap();
        assert_eq!(key, "uniq-1");
    }

    #[test]
    fn test_default_falls_back_to_delivery_id() {
        let extractor = KeyExtractor::<Delivery>::default();
        assert_eq!(
            extractor.key_for(&delivery(None, Some("msg-1"))).unwrap(),
            "msg-1"
        );
        assert_eq!(
            extractor.key_for(&delivery(Some(""), Some("msg-2"))).unwrap(),
            "msg-2"
        );
    }

    #[test]
    fn test_missing_key_fails_fast() {
        let extractor = KeyExtractor::<Delivery>::default();
        let err = extractor.key_for(&delivery(None, None)).unwrap_err();
        assert!(matches!(err, DedupError::MissingKey));
    }

    #[test]
    fn test_custom_extractor() {
        let extractor = KeyExtractor::new(|d: &Delivery| {
            d.msg_id.as_ref().map(|id| format!("{}:{}", d.topic, id))
        });
        assert_eq!(
            extractor.key_for(&delivery(Some("uniq"), Some("m9"))).unwrap(),
            "orders:m9"
        );
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("m1").is_ok());
        assert!(validate_key(&"x".repeat(MAX_KEY_LEN)).is_ok());

        let err = validate_key("").unwrap_err();
        assert!(matches!(err, DedupError::InvalidKey(_)));

        let err = validate_key(&"x".repeat(MAX_KEY_LEN + 1)).unwrap_err();
        assert!(matches!(err, DedupError::InvalidKey(_)));
    }
}
