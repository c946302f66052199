//! Provider URI resolution
//!
//! A node's `spec.providerID` has the form `gce://<project>/<zone>/<instance>`.
//! The resolver splits it into instance coordinates and asks the cloud
//! inventory for the instance's numeric id, which becomes the annotation value.

use std::fmt;
use std::sync::Arc;

use node_annotator_common::{Error, Result, GCE_PROVIDER_SCHEME};
use url::Url;

use crate::inventory::InstanceInventory;

/// Coordinates of a GCE instance parsed from a provider URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRef {
    /// Project id (the URI host)
    pub project: String,
    /// Zone (first path segment)
    pub zone: String,
    /// Instance name (second path segment)
    pub name: String,
}

impl InstanceRef {
    /// Parse a provider URI
    ///
    /// The scheme must be `gce` and the path must be exactly `/<zone>/<name>`.
    pub fn parse(uri: &str) -> Result<Self> {
        let url = match Url::parse(uri) {
            Ok(url) => url,
            // No scheme at all, so certainly not gce
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                return Err(Error::unsupported_provider(uri))
            }
            Err(e) => return Err(Error::malformed(uri, e.to_string())),
        };

        if url.scheme() != GCE_PROVIDER_SCHEME {
            return Err(Error::unsupported_provider(uri));
        }

        // The project is the whole authority, port included
        let host = url.host_str().unwrap_or_default();
        let project = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        // Escaped separators split the path like literal ones
        let path = urlencoding::decode(url.path())
            .map_err(|e| Error::malformed(uri, format!("invalid path encoding: {}", e)))?;
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() != 3 {
            return Err(Error::malformed(uri, "expected a three part path"));
        }
        if !parts[0].is_empty() {
            return Err(Error::malformed(
                uri,
                "expected part one of path to have length 0",
            ));
        }

        Ok(Self {
            project,
            zone: parts[1].to_string(),
            name: parts[2].to_string(),
        })
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.zone, self.name)
    }
}

/// Resolves provider URIs to numeric instance ids
#[derive(Clone)]
pub struct IdentityResolver {
    inventory: Arc<dyn InstanceInventory>,
}

impl IdentityResolver {
    /// Create a resolver backed by the given inventory
    pub fn new(inventory: Arc<dyn InstanceInventory>) -> Self {
        Self { inventory }
    }

    /// Resolve a provider URI to the decimal form of its instance id
    ///
    /// Parse failures and lookup failures are both returned as errors; the
    /// caller does not distinguish lookup failure kinds.
    pub async fn resolve(&self, provider_uri: &str) -> Result<String> {
        let instance = InstanceRef::parse(provider_uri)?;
        let record = self
            .inventory
            .get_instance(&instance.project, &instance.zone, &instance.name)
            .await?;
        Ok(record.id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{InstanceRecord, MockInstanceInventory};
    use mockall::predicate::eq;

    #[test]
    fn parses_well_formed_uri() {
        let r = InstanceRef::parse("gce://proj-1/us-central1-a/vm-7").unwrap();
        assert_eq!(r.project, "proj-1");
        assert_eq!(r.zone, "us-central1-a");
        assert_eq!(r.name, "vm-7");
        assert_eq!(r.to_string(), "proj-1/us-central1-a/vm-7");
    }

    #[test]
    fn rejects_other_schemes() {
        let err = InstanceRef::parse("aws://x/y/z").unwrap_err();
        assert!(matches!(err, Error::UnsupportedProvider { .. }));
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(matches!(
            InstanceRef::parse("").unwrap_err(),
            Error::UnsupportedProvider { .. }
        ));
        assert!(matches!(
            InstanceRef::parse("proj-1/us-central1-a/vm-7").unwrap_err(),
            Error::UnsupportedProvider { .. }
        ));
    }

    #[test]
    fn rejects_wrong_segment_count() {
        for uri in [
            "gce://proj-1/only-one-segment",
            "gce://proj-1/us-central1-a/vm-7/extra",
            "gce://proj-1/us-central1-a/vm-7/",
            "gce://proj-1",
            "gce://proj-1/us-central1-a%2Fvm-7",
            "gce://proj-1/us-central1-a/vm%2Fx",
        ] {
            let err = InstanceRef::parse(uri).unwrap_err();
            assert!(
                matches!(err, Error::MalformedProviderUri { ref reason, .. } if reason.contains("three part")),
                "{uri}: {err}"
            );
        }
    }

    #[test]
    fn decodes_escaped_path_segments() {
        let r = InstanceRef::parse("gce://proj-1/us%2Dcentral1-a/vm%2D7").unwrap();
        assert_eq!(r.zone, "us-central1-a");
        assert_eq!(r.name, "vm-7");
    }

    #[test]
    fn keeps_port_in_project() {
        let r = InstanceRef::parse("gce://proj-1:99/us-central1-a/vm-7").unwrap();
        assert_eq!(r.project, "proj-1:99");
        assert_eq!(r.name, "vm-7");
    }

    #[test]
    fn rejects_path_without_leading_slash() {
        let err = InstanceRef::parse("gce:proj/zone/vm").unwrap_err();
        assert!(
            matches!(err, Error::MalformedProviderUri { ref reason, .. } if reason.contains("length 0")),
            "{err}"
        );
    }

    #[tokio::test]
    async fn resolve_formats_id_as_decimal() {
        let mut inventory = MockInstanceInventory::new();
        inventory
            .expect_get_instance()
            .with(eq("proj-1"), eq("us-central1-a"), eq("vm-7"))
            .times(1)
            .returning(|_, _, name| {
                Ok(InstanceRecord {
                    id: u64::MAX,
                    name: name.to_string(),
                    status: None,
                })
            });

        let resolver = IdentityResolver::new(Arc::new(inventory));
        let id = resolver
            .resolve("gce://proj-1/us-central1-a/vm-7")
            .await
            .unwrap();
        assert_eq!(id, "18446744073709551615");
    }

    #[tokio::test]
    async fn resolve_does_not_query_for_malformed_uri() {
        let mut inventory = MockInstanceInventory::new();
        inventory.expect_get_instance().never();

        let resolver = IdentityResolver::new(Arc::new(inventory));
        let err = resolver
            .resolve("gce://proj-1/only-one-segment")
            .await
            .unwrap_err();
        assert!(err.is_malformed_identity());
    }

    #[tokio::test]
    async fn resolve_surfaces_lookup_errors() {
        let mut inventory = MockInstanceInventory::new();
        inventory
            .expect_get_instance()
            .returning(|p, z, n| Err(Error::lookup(p, z, n, "HTTP 404: not found")));

        let resolver = IdentityResolver::new(Arc::new(inventory));
        let err = resolver
            .resolve("gce://proj-1/us-central1-a/vm-7")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InstanceLookup { .. }));
        assert!(err.to_string().contains("404"));
    }
}
