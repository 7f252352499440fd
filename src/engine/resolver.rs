//! Update Resolver
//!
//! Decides, for one client request, whether a release is offered and which
//! package (full or delta) it should fetch.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use tracing::debug;

use crate::engine::release::version::{is_newer, range_admits};
use crate::engine::release::{Release, ReleaseStore, Scope, StoreError};

/// Source of the per-request rollout sample, uniform in `[0, 100)`
pub trait RolloutSampler: Send + Sync {
    fn sample(&self) -> u8;
}

/// Thread-local RNG; the production sampler
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngSampler;

impl RolloutSampler for ThreadRngSampler {
    fn sample(&self) -> u8 {
        rand::thread_rng().gen_range(0..100)
    }
}

/// Always returns the same sample
#[derive(Debug, Clone, Copy)]
pub struct FixedSampler(pub u8);

impl RolloutSampler for FixedSampler {
    fn sample(&self) -> u8 {
        self.0.min(99)
    }
}

/// Reproducible pseudo-random sequence
pub struct SeededSampler {
    rng: Mutex<StdRng>,
}

impl SeededSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RolloutSampler for SeededSampler {
    fn sample(&self) -> u8 {
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0..100),
            Err(poisoned) => poisoned.into_inner().gen_range(0..100),
        }
    }
}

/// What a client asked about
#[derive(Debug, Clone)]
pub struct ResolveRequest<'a> {
    pub current_version: &'a str,
    pub host_binary_version: Option<&'a str>,
}

/// The release offered to a client
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    pub release: Release,
    /// Delta reference when one exists from the client's version, else the full package
    pub package_reference: String,
    pub is_diff: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Update(Offer),
    NoUpdate,
}

impl Resolution {
    pub fn offer(&self) -> Option<&Offer> {
        match self {
            Resolution::Update(offer) => Some(offer),
            Resolution::NoUpdate => None,
        }
    }
}

/// First release of a newest-first list that this client may install,
/// ignoring rollout.
pub fn select_applicable<'r>(
    releases: &'r [Release],
    request: &ResolveRequest<'_>,
) -> Option<&'r Release> {
    releases.iter().find(|release| {
        if release.version == request.current_version {
            return false;
        }
        // incomparable versions are not skipped
        if is_newer(&release.version, request.current_version) == Some(false) {
            return false;
        }
        if !range_admits(&release.target_binary_range, request.host_binary_version) {
            return false;
        }
        !release.disabled
    })
}

pub struct Resolver<'s> {
    store: &'s dyn ReleaseStore,
    sampler: &'s dyn RolloutSampler,
}

impl<'s> Resolver<'s> {
    pub fn new(store: &'s dyn ReleaseStore, sampler: &'s dyn RolloutSampler) -> Self {
        Self { store, sampler }
    }

    pub fn resolve(
        &self,
        scope: &Scope,
        request: &ResolveRequest<'_>,
    ) -> Result<Resolution, StoreError> {
        let releases = self.store.list(scope)?;
        Ok(self.resolve_from(&releases, request))
    }

    /// Resolution over an already-read snapshot of a scope
    pub fn resolve_from(&self, releases: &[Release], request: &ResolveRequest<'_>) -> Resolution {
        let Some(release) = select_applicable(releases, request) else {
            debug!(current = request.current_version, "No applicable release");
            return Resolution::NoUpdate;
        };

        let sample = self.sampler.sample();
        if sample >= release.rollout_percent {
            debug!(
                version = %release.version,
                sample,
                rollout = release.rollout_percent,
                "Request outside rollout"
            );
            return Resolution::NoUpdate;
        }

        let (package_reference, is_diff) =
            match release.diff_references.get(request.current_version) {
                Some(reference) => (reference.clone(), true),
                None => (release.package_reference.clone(), false),
            };

        Resolution::Update(Offer {
            release: release.clone(),
            package_reference,
            is_diff,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::release::{MemoryReleaseStore, Platform};

    fn release(version: &str) -> Release {
        Release::new(version, Platform::Ios, &format!("{}.zip", version), "h", 1)
    }

    fn request(current: &str) -> ResolveRequest<'_> {
        ResolveRequest {
            current_version: current,
            host_binary_version: None,
        }
    }

    fn offered(resolution: &Resolution) -> Option<&str> {
        resolution.offer().map(|o| o.release.version.as_str())
    }

    #[test]
    fn test_disable_falls_back_to_older_release() {
        let store = MemoryReleaseStore::new();
        let scope = Scope::new("key", Platform::Ios);
        store.append(&scope, release("1.5.0")).unwrap();
        store.append(&scope, release("2.0.0")).unwrap();
        let sampler = FixedSampler(99);
        let resolver = Resolver::new(&store, &sampler);

        let first = resolver.resolve(&scope, &request("1.0.0")).unwrap();
        assert_eq!(offered(&first), Some("2.0.0"));

        store
            .mutate(&scope, "2.0.0", &mut |r| r.disabled = true)
            .unwrap();
        let second = resolver.resolve(&scope, &request("1.0.0")).unwrap();
        assert_eq!(offered(&second), Some("1.5.0"));
    }

    #[test]
    fn test_never_offers_current_version() {
        let releases = vec![release("1.0.0")];
        let resolver_store = MemoryReleaseStore::new();
        let sampler = FixedSampler(0);
        let resolver = Resolver::new(&resolver_store, &sampler);
        assert_eq!(
            resolver.resolve_from(&releases, &request("1.0.0")),
            Resolution::NoUpdate
        );
    }

    #[test]
    fn test_older_releases_are_skipped() {
        let releases = vec![release("0.9.0")];
        assert!(select_applicable(&releases, &request("1.0.0")).is_none());
    }

    #[test]
    fn test_unparseable_versions_are_offered() {
        let releases = vec![release("build-7")];
        assert_eq!(
            select_applicable(&releases, &request("1.0.0")).map(|r| r.version.as_str()),
            Some("build-7")
        );
    }

    #[test]
    fn test_newest_admissible_wins_without_scanning_further() {
        // the newest entry is admissible but outside rollout: no fallback to older entries
        let releases = vec![release("2.0.0").with_rollout(0), release("1.5.0")];
        let store = MemoryReleaseStore::new();
        let sampler = FixedSampler(0);
        let resolver = Resolver::new(&store, &sampler);
        assert_eq!(
            resolver.resolve_from(&releases, &request("1.0.0")),
            Resolution::NoUpdate
        );
    }

    #[test]
    fn test_rollout_bounds() {
        let store = MemoryReleaseStore::new();
        let zero = vec![release("2.0.0").with_rollout(0)];
        let full = vec![release("2.0.0").with_rollout(100)];
        for sample in [0u8, 1, 50, 99] {
            let sampler = FixedSampler(sample);
            let resolver = Resolver::new(&store, &sampler);
            assert_eq!(
                resolver.resolve_from(&zero, &request("1.0.0")),
                Resolution::NoUpdate
            );
            assert!(resolver.resolve_from(&full, &request("1.0.0")).offer().is_some());
        }
    }

    #[test]
    fn test_partial_rollout_uses_sample() {
        let store = MemoryReleaseStore::new();
        let releases = vec![release("2.0.0").with_rollout(30)];

        let inside = FixedSampler(29);
        assert!(Resolver::new(&store, &inside)
            .resolve_from(&releases, &request("1.0.0"))
            .offer()
            .is_some());

        let outside = FixedSampler(30);
        assert_eq!(
            Resolver::new(&store, &outside).resolve_from(&releases, &request("1.0.0")),
            Resolution::NoUpdate
        );
    }

    #[test]
    fn test_seeded_sampler_is_reproducible() {
        let a = SeededSampler::new(42);
        let b = SeededSampler::new(42);
        let run_a: Vec<u8> = (0..20).map(|_| a.sample()).collect();
        let run_b: Vec<u8> = (0..20).map(|_| b.sample()).collect();
        assert_eq!(run_a, run_b);
        assert!(run_a.iter().all(|s| *s < 100));
    }

    #[test]
    fn test_binary_range_requires_host_version() {
        let releases = vec![release("2.0.0").with_target_binary_range("^3.0.0")];
        assert!(select_applicable(&releases, &request("1.0.0")).is_none());

        let with_host = ResolveRequest {
            current_version: "1.0.0",
            host_binary_version: Some("3.2.0"),
        };
        assert!(select_applicable(&releases, &with_host).is_some());

        let wrong_host = ResolveRequest {
            current_version: "1.0.0",
            host_binary_version: Some("4.0.0"),
        };
        assert!(select_applicable(&releases, &wrong_host).is_none());
    }

    #[test]
    fn test_prefers_delta_from_current_version() {
        let store = MemoryReleaseStore::new();
        let sampler = FixedSampler(0);
        let resolver = Resolver::new(&store, &sampler);
        let releases = vec![release("2.0.0").with_diff("1.0.0", "delta-1.zip")];

        let from_diffable = resolver.resolve_from(&releases, &request("1.0.0"));
        let offer = from_diffable.offer().unwrap();
        assert!(offer.is_diff);
        assert_eq!(offer.package_reference, "delta-1.zip");

        let from_other = resolver.resolve_from(&releases, &request("1.1.0"));
        let offer = from_other.offer().unwrap();
        assert!(!offer.is_diff);
        assert_eq!(offer.package_reference, "2.0.0.zip");
    }
}
