//! Image set reconciliation.
//!
//! This library decides which container images a cluster must newly fetch
//! before an apply or upgrade proceeds. Key concepts:
//!
//! - **Desired state**: The image list the cluster should be running.
//! - **Current state**: The image list the cluster declares it runs now.
//! - **Pull set**: The minimal, order-stable set of images to fetch.
//!
//! # Invariants
//!
//! - All functions are total: any input, including absent descriptors and
//!   empty lists, produces a defined result and never an error.
//! - Results are deterministic given the same inputs.
//! - Diff output preserves the desired list's declaration order.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A container image reference (`registry/repository:tag`).
///
/// References are opaque tokens compared by exact string equality, not by
/// semantic version or digest.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ImageRef(String);

impl ImageRef {
    /// Create a reference from its string form.
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Get the reference string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ImageRef {
    fn from(reference: &str) -> Self {
        Self(reference.to_string())
    }
}

impl From<String> for ImageRef {
    fn from(reference: String) -> Self {
        Self(reference)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A cluster's declared state, as seen by the reconciler.
///
/// Owned by the outer cluster-management system; this library only reads
/// the image sequence and never mutates it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    /// Declared images, in declaration order, duplicates allowed.
    pub images: Vec<ImageRef>,
}

impl ClusterDescriptor {
    /// Create a descriptor from an image list.
    pub fn new(images: Vec<ImageRef>) -> Self {
        Self { images }
    }
}

/// A content hash over a deduplicated, order-independent image set.
///
/// Used to detect when two declared image lists are semantically
/// equivalent regardless of ordering or repeated entries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageSetHash(String);

impl ImageSetHash {
    /// Compute the hash of an image list's distinct reference set.
    ///
    /// References are deduplicated and canonically sorted before hashing,
    /// so permutations and duplicates of the same set hash identically.
    pub fn of(images: &[ImageRef]) -> Self {
        let canonical: BTreeSet<&str> = images.iter().map(ImageRef::as_str).collect();

        let mut hasher = Sha256::new();
        for reference in &canonical {
            hasher.update(reference.as_bytes());
            // NUL framing keeps adjacent references unambiguous
            hasher.update([0u8]);
        }
        let result = hasher.finalize();

        Self(format!("sha256:{}", hex::encode(&result[..16])))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageSetHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compute the images in `desired` that are absent from `current`.
///
/// Returns a subsequence of `desired` in its original order, deduplicated,
/// containing every reference that appears nowhere in `current`. The
/// current list is treated as a membership set, so duplicates in it are
/// irrelevant. An empty result means nothing new to pull.
pub fn compute_image_diff(current: &[ImageRef], desired: &[ImageRef]) -> Vec<ImageRef> {
    let present: HashSet<&ImageRef> = current.iter().collect();

    let mut emitted = HashSet::new();
    let mut diff = Vec::new();
    for image in desired {
        if !present.contains(image) && emitted.insert(image) {
            diff.push(image.clone());
        }
    }

    diff
}

/// Check whether two image lists declare the same distinct reference set.
///
/// Ordering and repeat counts are irrelevant; only the deduplicated set of
/// references decides equivalence.
pub fn image_spec_hash_equal(a: &[ImageRef], b: &[ImageRef]) -> bool {
    ImageSetHash::of(a) == ImageSetHash::of(b)
}

/// Resolve the images a cluster must newly fetch, given its current and
/// desired descriptors.
///
/// - No desired descriptor: nothing to pull, empty result.
/// - Desired but no current descriptor: no images are already present, so
///   the desired sequence is returned verbatim, duplicates and order
///   preserved, as the first-time pull manifest.
/// - Both present: the incremental diff via [`compute_image_diff`].
pub fn resolve_new_images(
    current: Option<&ClusterDescriptor>,
    desired: Option<&ClusterDescriptor>,
) -> Vec<ImageRef> {
    let Some(desired) = desired else {
        return Vec::new();
    };

    match current {
        None => desired.images.clone(),
        Some(current) => compute_image_diff(&current.images, &desired.images),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(names: &[&str]) -> Vec<ImageRef> {
        names.iter().copied().map(ImageRef::from).collect()
    }

    #[test]
    fn test_image_diff_finds_only_new_images() {
        let current = refs(&[
            "registry.k8s.io/base/kubernetes:v1.25.6",
            "registry.k8s.io/base/kubernetes:v1.25.6",
            "registry.k8s.io/base/helm:v3.11.0",
            "registry.k8s.io/base/calico:v3.24.5",
        ]);
        let desired = refs(&[
            "registry.k8s.io/base/kubernetes:v1.25.6",
            "registry.k8s.io/base/helm:v3.11.0",
            "registry.k8s.io/base/helm:v3.11.0",
            "registry.k8s.io/base/calico:v3.24.5",
            "registry.k8s.io/base/nginx:v1.23.3",
        ]);

        let diff = compute_image_diff(&current, &desired);

        assert_eq!(diff, refs(&["registry.k8s.io/base/nginx:v1.23.3"]));
    }

    #[test]
    fn test_image_diff_empty_when_all_present() {
        let current = refs(&["a/b:v1", "c/d:v2", "e/f:v3"]);
        let desired = refs(&["c/d:v2", "a/b:v1", "a/b:v1"]);

        assert!(compute_image_diff(&current, &desired).is_empty());
    }

    #[test]
    fn test_image_diff_dedups_new_images_preserving_order() {
        let current = refs(&["a/b:v1"]);
        let desired = refs(&["x/y:v1", "a/b:v1", "z/w:v1", "x/y:v1", "x/y:v1"]);

        let diff = compute_image_diff(&current, &desired);

        assert_eq!(diff, refs(&["x/y:v1", "z/w:v1"]));
    }

    #[test]
    fn test_image_diff_empty_current() {
        let desired = refs(&["a/b:v1", "a/b:v1", "c/d:v2"]);

        // Diff deduplicates even against an empty current list.
        let diff = compute_image_diff(&[], &desired);

        assert_eq!(diff, refs(&["a/b:v1", "c/d:v2"]));
    }

    #[test]
    fn test_spec_hash_ignores_order_and_duplicates() {
        let a = refs(&[
            "registry.k8s.io/base/kubernetes:v1.25.6",
            "registry.k8s.io/base/kubernetes:v1.25.6",
            "registry.k8s.io/base/helm:v3.11.0",
            "registry.k8s.io/base/calico:v3.24.5",
        ]);
        let b = refs(&[
            "registry.k8s.io/base/calico:v3.24.5",
            "registry.k8s.io/base/helm:v3.11.0",
            "registry.k8s.io/base/kubernetes:v1.25.6",
        ]);

        assert!(image_spec_hash_equal(&a, &b));
        assert_eq!(ImageSetHash::of(&a), ImageSetHash::of(&b));
    }

    #[test]
    fn test_spec_hash_detects_changed_set() {
        let current = refs(&[
            "registry.k8s.io/base/kubernetes:v1.25.6",
            "registry.k8s.io/base/helm:v3.11.0",
            "registry.k8s.io/base/calico:v3.24.5",
        ]);
        let desired = refs(&[
            "registry.k8s.io/base/kubernetes:v1.25.6",
            "registry.k8s.io/base/helm:v3.11.0",
            "registry.k8s.io/base/calico:v3.24.5",
            "registry.k8s.io/base/nginx:v1.23.3",
            "registry.k8s.io/base/nginx:v1.23.5",
        ]);

        assert!(!image_spec_hash_equal(&current, &desired));
    }

    #[test]
    fn test_spec_hash_of_empty_lists() {
        assert!(image_spec_hash_equal(&[], &[]));
        assert!(!image_spec_hash_equal(&[], &refs(&["a/b:v1"])));
    }

    #[test]
    fn test_spec_hash_display_format() {
        let hash = ImageSetHash::of(&refs(&["a/b:v1"]));
        assert!(hash.as_str().starts_with("sha256:"));
    }

    #[test]
    fn test_resolve_new_images_no_desired() {
        assert!(resolve_new_images(None, None).is_empty());

        let current = ClusterDescriptor::new(refs(&["a/b:v1"]));
        assert!(resolve_new_images(Some(&current), None).is_empty());
    }

    #[test]
    fn test_resolve_new_images_no_current_returns_manifest_verbatim() {
        let desired = ClusterDescriptor::new(refs(&[
            "registry.k8s.io/base/kubernetes:v1.25.6",
            "registry.k8s.io/base/helm:v3.11.0",
            "registry.k8s.io/base/helm:v3.11.0",
            "registry.k8s.io/base/calico:v3.24.5",
        ]));

        // First-time pull: duplicates and order preserved.
        assert_eq!(resolve_new_images(None, Some(&desired)), desired.images);
    }

    #[test]
    fn test_resolve_new_images_diffs_against_current() {
        let current = ClusterDescriptor::new(refs(&[
            "registry.k8s.io/base/kubernetes:v1.25.6",
            "registry.k8s.io/base/kubernetes:v1.25.6",
            "registry.k8s.io/base/helm:v3.11.0",
            "registry.k8s.io/base/calico:v3.24.5",
        ]));
        let desired = ClusterDescriptor::new(refs(&[
            "registry.k8s.io/base/kubernetes:v1.25.6",
            "registry.k8s.io/base/helm:v3.11.0",
            "registry.k8s.io/base/helm:v3.11.0",
            "registry.k8s.io/base/calico:v3.24.5",
            "registry.k8s.io/base/nginx:v1.23.3",
        ]));

        assert_eq!(
            resolve_new_images(Some(&current), Some(&desired)),
            refs(&["registry.k8s.io/base/nginx:v1.23.3"])
        );
    }

    #[test]
    fn test_resolve_new_images_identical_sets() {
        let current = ClusterDescriptor::new(refs(&["a/b:v1", "a/b:v1", "c/d:v2"]));
        let desired = ClusterDescriptor::new(refs(&["c/d:v2", "a/b:v1"]));

        assert!(resolve_new_images(Some(&current), Some(&desired)).is_empty());
    }
}
