// src/protocol.rs

//! Named protocols and version negotiation.
//!
//! A protocol declares the inclusive version range
//! `[supported_version, current_version]` it can speak. During channel
//! establishment the peers exchange ranges and settle on the highest
//! version both can speak; disjoint ranges fail negotiation. Factories are
//! built lazily per negotiated version and memoized for the lifetime of
//! the protocol.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::message::MessageFactory;

/// Populates a factory with the message types of one protocol version.
/// The factory's [`MessageFactory::version`] tells the callback which
/// version it is building.
pub type FactoryPopulator = fn(&mut MessageFactory);

/// A named protocol with a negotiable version range.
pub struct Protocol {
    name: String,
    supported_version: i32,
    current_version: i32,
    populate: FactoryPopulator,
    factories: Mutex<HashMap<i32, Arc<MessageFactory>>>,
}

impl Protocol {
    /// Declare a protocol speaking every version in
    /// `supported_version..=current_version`.
    pub fn new(
        name: impl Into<String>,
        supported_version: i32,
        current_version: i32,
        populate: FactoryPopulator,
    ) -> Result<Self> {
        if supported_version < 0 || current_version < supported_version {
            return Err(Error::IllegalState("invalid protocol version range"));
        }
        Ok(Protocol {
            name: name.into(),
            supported_version,
            current_version,
            populate,
            factories: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn supported_version(&self) -> i32 {
        self.supported_version
    }

    pub fn current_version(&self) -> i32 {
        self.current_version
    }

    /// Pick the highest version both ranges contain.
    pub fn negotiate(&self, remote_supported: i32, remote_current: i32) -> Result<i32> {
        let version = self.current_version.min(remote_current);
        if version >= self.supported_version.max(remote_supported) {
            Ok(version)
        } else {
            Err(Error::ProtocolVersionMismatch {
                protocol: self.name.clone(),
                local: (self.supported_version, self.current_version),
                remote: (remote_supported, remote_current),
            })
        }
    }

    /// The factory for a negotiated version, memoized per version.
    pub fn factory(&self, version: i32) -> Result<Arc<MessageFactory>> {
        if version < self.supported_version || version > self.current_version {
            return Err(Error::ProtocolVersionMismatch {
                protocol: self.name.clone(),
                local: (self.supported_version, self.current_version),
                remote: (version, version),
            });
        }
        let mut factories = self.factories.lock();
        if let Some(factory) = factories.get(&version) {
            return Ok(factory.clone());
        }
        let mut factory = MessageFactory::new(self.name.clone(), version);
        (self.populate)(&mut factory);
        let factory = Arc::new(factory);
        factories.insert(version, factory.clone());
        Ok(factory)
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("supported_version", &self.supported_version)
            .field("current_version", &self.current_version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proto(supported: i32, current: i32) -> Protocol {
        Protocol::new("cache", supported, current, |_| {}).unwrap()
    }

    #[test]
    fn invalid_range_rejected() {
        assert!(Protocol::new("x", 3, 2, |_| {}).is_err());
        assert!(Protocol::new("x", -1, 2, |_| {}).is_err());
    }

    #[test]
    fn negotiation_picks_highest_common() {
        let p = proto(2, 5);
        assert_eq!(p.negotiate(1, 4).unwrap(), 4);
        assert_eq!(p.negotiate(3, 9).unwrap(), 5);
        assert_eq!(p.negotiate(2, 2).unwrap(), 2);
        assert_eq!(p.negotiate(5, 5).unwrap(), 5);
    }

    #[test]
    fn disjoint_ranges_fail() {
        let p = proto(2, 5);
        let err = p.negotiate(6, 9).unwrap_err();
        assert!(matches!(err, Error::ProtocolVersionMismatch { .. }));
        assert!(matches!(
            p.negotiate(0, 1),
            Err(Error::ProtocolVersionMismatch { .. })
        ));
    }

    #[test]
    fn factories_are_memoized_per_version() {
        let p = proto(1, 3);
        let a = p.factory(2).unwrap();
        let b = p.factory(2).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = p.factory(3).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.version(), 2);
        assert_eq!(c.version(), 3);
    }

    #[test]
    fn out_of_range_factory_refused() {
        let p = proto(2, 5);
        assert!(p.factory(1).is_err());
        assert!(p.factory(6).is_err());
    }
}
