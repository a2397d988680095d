//! Stable identity generation.
//!
//! Every id that must agree across tabs, browsers and sessions is derived from
//! the `(kind, owner, project, discriminator)` tuple with FNV-1a. No clock and
//! no randomness are involved, so reloading the same files in the same order
//! reproduces the same ids without any coordination.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Project name used when the caller does not pick one.
pub const DEFAULT_PROJECT_NAME: &str = "current";

/// Stand-in for empty tuple components.
const EMPTY_PLACEHOLDER: &str = "_";

/// Separates tuple components before hashing ("ab"+"c" must differ from "a"+"bc").
const FIELD_SEPARATOR: u8 = 0x1f;

/// The kind of entity an id is derived for. Doubles as the id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Project,
    Image,
    Session,
    Instance,
}

impl EntityKind {
    pub fn prefix(self) -> &'static str {
        match self {
            EntityKind::Project => "proj",
            EntityKind::Image => "img",
            EntityKind::Session => "sess",
            EntityKind::Instance => "inst",
        }
    }
}

/// Derive a reproducible id for `(kind, owner, project, discriminator)`.
///
/// Components are trimmed, the owner is lower-cased (emails are
/// case-insensitive) and empty components collapse to a placeholder.
///
/// ```
/// use fieldsync_core::identity::{derive_id, EntityKind};
///
/// let a = derive_id(EntityKind::Image, "Eng@Example.com", "current", "PB080001.JPG#0");
/// let b = derive_id(EntityKind::Image, "eng@example.com", "current", "PB080001.JPG#0");
/// assert_eq!(a, b);
/// assert!(a.starts_with("img_"));
/// ```
pub fn derive_id(kind: EntityKind, owner: &str, project: &str, discriminator: &str) -> String {
    let owner_lower = owner.trim().to_lowercase();
    let owner = normalize_component(&owner_lower);
    let project = normalize_component(project.trim());
    let discriminator = normalize_component(discriminator.trim());

    let mut bytes = Vec::with_capacity(owner.len() + project.len() + discriminator.len() + 8);
    bytes.extend_from_slice(kind.prefix().as_bytes());
    for part in [owner, project, discriminator] {
        bytes.push(FIELD_SEPARATOR);
        bytes.extend_from_slice(part.as_bytes());
    }

    format!("{}_{:016x}", kind.prefix(), fnv1a_hash(&bytes))
}

/// Id of an uploaded image. `upload_order` is the position in the upload batch
/// sequence for this project.
pub fn image_id(owner: &str, project: &str, file_name: &str, upload_order: u32) -> String {
    derive_id(
        EntityKind::Image,
        owner,
        project,
        &format!("{}#{}", file_name.trim(), upload_order),
    )
}

/// Fresh id for a new selection instance of `image_id`.
///
/// Instances are created by explicit user action and must stay unique even when
/// two tabs select the same image concurrently, so the discriminator carries a
/// random nonce. The id itself still goes through [`derive_id`] to keep the
/// `inst_<16 hex>` shape.
pub fn new_instance_id(owner: &str, project: &str, image_id: &str) -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    derive_id(
        EntityKind::Instance,
        owner,
        project,
        &format!("{}#{}", image_id, nonce),
    )
}

fn normalize_component(s: &str) -> &str {
    if s.is_empty() { EMPTY_PLACEHOLDER } else { s }
}

/// FNV-1a hash. Stable across Rust versions (unlike DefaultHasher).
fn fnv1a_hash(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// The account whose data is being synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Owner for a signed-in user. Emails are stored lower-cased.
    pub fn new(owner: &str) -> Self {
        Self(owner.trim().to_lowercase())
    }

    /// Generate an owner id for a signed-out user.
    pub fn anonymous() -> Self {
        use rand::Rng;
        let id: u64 = rand::rng().random();
        Self(format!("anon_{:016x}", id))
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.starts_with("anon_")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for OwnerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An owner's project: name plus its derived id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProjectRef {
    pub owner: OwnerId,
    pub name: String,
    pub id: String,
}

impl ProjectRef {
    pub fn new(owner: OwnerId, name: &str) -> Self {
        let name = if name.trim().is_empty() {
            DEFAULT_PROJECT_NAME.to_string()
        } else {
            name.trim().to_string()
        };
        let id = derive_id(EntityKind::Project, owner.as_str(), &name, "");
        Self { owner, name, id }
    }

    /// The hex part of the project id, used in local storage keys.
    pub fn hash(&self) -> &str {
        self.id.split_once('_').map(|(_, h)| h).unwrap_or(&self.id)
    }

    /// Derive an image id scoped to this project.
    pub fn image_id(&self, file_name: &str, upload_order: u32) -> String {
        image_id(self.owner.as_str(), &self.name, file_name, upload_order)
    }

    /// Generate a new instance id for a selection of `image_id`.
    pub fn new_instance_id(&self, image_id: &str) -> String {
        new_instance_id(self.owner.as_str(), &self.name, image_id)
    }

    /// Derive the session id for a given tab label.
    pub fn session_id(&self, tab: &str) -> String {
        derive_id(EntityKind::Session, self.owner.as_str(), &self.name, tab)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_id_is_deterministic() {
        let first = image_id("eng@example.com", "current", "PB080001.JPG", 0);
        for _ in 0..100 {
            assert_eq!(image_id("eng@example.com", "current", "PB080001.JPG", 0), first);
        }
    }

    #[test]
    fn test_owner_is_trimmed_and_case_folded() {
        let id = derive_id(EntityKind::Image, "eng@example.com", "current", "a#0");
        assert_eq!(derive_id(EntityKind::Image, "  ENG@Example.com ", "current", "a#0"), id);
        assert_eq!(
            derive_id(EntityKind::Image, "   ", "current", "a#0"),
            derive_id(EntityKind::Image, "", "current", "a#0")
        );
    }

    #[test]
    fn test_derive_id_known_vector() {
        // Pinned so a change to the hashing scheme is caught here and not in the field.
        let id = derive_id(EntityKind::Project, "a", "b", "c");
        let mut bytes = b"proj".to_vec();
        for part in [b"a", b"b", b"c"] {
            bytes.push(0x1f);
            bytes.extend_from_slice(part);
        }
        assert_eq!(id, format!("proj_{:016x}", fnv1a_hash(&bytes)));
        assert_eq!(fnv1a_hash(b""), 0xcbf29ce484222325);
    }

    #[test]
    fn test_upload_order_changes_id() {
        let a = image_id("o", "current", "PB080001.JPG", 0);
        let b = image_id("o", "current", "PB080001.JPG", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_kind_changes_id() {
        let image = derive_id(EntityKind::Image, "o", "p", "x");
        let session = derive_id(EntityKind::Session, "o", "p", "x");
        assert_ne!(image[4..], session[5..]);
    }

    #[test]
    fn test_separator_prevents_concatenation_collisions() {
        assert_ne!(
            derive_id(EntityKind::Image, "ab", "c", "d"),
            derive_id(EntityKind::Image, "a", "bc", "d")
        );
    }

    #[test]
    fn test_empty_discriminator_is_normalized() {
        assert_eq!(
            derive_id(EntityKind::Session, "o", "p", ""),
            derive_id(EntityKind::Session, "o", "p", "   ")
        );
        assert_eq!(
            derive_id(EntityKind::Session, "o", "p", ""),
            derive_id(EntityKind::Session, "o", "p", "_")
        );
    }

    #[test]
    fn test_owner_is_case_insensitive() {
        assert_eq!(
            image_id("Eng@Example.COM ", "current", "a.jpg", 3),
            image_id("eng@example.com", "current", "a.jpg", 3)
        );
    }

    #[test]
    fn test_project_ref_defaults_name() {
        let project = ProjectRef::new(OwnerId::new("o"), "  ");
        assert_eq!(project.name, DEFAULT_PROJECT_NAME);
        assert!(project.id.starts_with("proj_"));
        assert_eq!(project.hash().len(), 16);
    }

    #[test]
    fn test_anonymous_owner() {
        let owner = OwnerId::anonymous();
        assert!(owner.is_anonymous());
        assert!(!OwnerId::new("eng@example.com").is_anonymous());
    }

    #[test]
    fn test_instance_ids_are_unique() {
        let project = ProjectRef::new(OwnerId::new("o"), "current");
        let a = project.new_instance_id("img_0000000000000001");
        let b = project.new_instance_id("img_0000000000000001");
        assert_ne!(a, b);
        assert!(a.starts_with("inst_"));
        assert_eq!(a.len(), "inst_".len() + 16);
    }
}
