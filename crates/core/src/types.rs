use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! newtype_string {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string value.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Return the inner string as a str slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;

            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(TenantId, "Identifies a registered account that owns products.");
newtype_string!(ProductId, "Identifies one registered game or application.");
newtype_string!(
    TokenValue,
    "The opaque credential scoping all telemetry for one product."
);
newtype_string!(
    VhostId,
    "A broker virtual host provisioned for one token's queues."
);
newtype_string!(
    SessionId,
    "A client-supplied session identifier, unique within (token, client)."
);

/// The per-install identity reporting telemetry. Assigned a random unique
/// integer at first contact (see the store's client registration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub i64);

impl ClientId {
    #[must_use]
    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ClientId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_from_str() {
        let tenant = TenantId::from("studio-red");
        assert_eq!(tenant.as_str(), "studio-red");
        assert_eq!(&*tenant, "studio-red");
    }

    #[test]
    fn newtype_serde_roundtrip() {
        let product = ProductId::new("prod-7");
        let json = serde_json::to_string(&product).unwrap();
        assert_eq!(json, "\"prod-7\"");
        let back: ProductId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, product);
    }

    #[test]
    fn client_id_display_and_serde() {
        let id = ClientId(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
    }
}
