//! Remote tag grammar for [`crate::RepoStagesStore`]: the exact string
//! encoding used to represent stages, managed-image markers, commit
//! metadata, and client-ID records as registry tags.

use kiln_hash::Digest256;

/// The empty image name maps to this reserved tag instead of an empty slug
/// segment, which would otherwise collide with adjacent `-` separators.
pub const NAMELESS_IMAGE_TAG: &str = "__nameless__";

pub const MANAGED_IMAGE_PREFIX: &str = "managed-image-";
pub const IMAGE_METADATA_BY_COMMIT_PREFIX: &str = "image-metadata-by-commit-";
pub const CLIENT_ID_PREFIX: &str = "client-id-";

/// Replace path/encoding-hostile characters in an image name so it can be
/// embedded in a single tag segment. Exact inverse of [`unslug`].
pub fn slug(image_name: &str) -> String {
    if image_name.is_empty() {
        return NAMELESS_IMAGE_TAG.to_string();
    }
    image_name.replace('/', "__slash__").replace('+', "__plus__")
}

pub fn unslug(slugged: &str) -> String {
    if slugged == NAMELESS_IMAGE_TAG {
        return String::new();
    }
    slugged.replace("__slash__", "/").replace("__plus__", "+")
}

/// `{signature}-{uniqueID}`.
pub fn stage_tag(signature: Digest256, unique_id: u64) -> String {
    format!("{signature}-{unique_id}")
}

/// Parse a stage tag back into (signature, uniqueID). Returns `None` on any
/// shape mismatch — callers skip unrecognized tags rather than error.
pub fn parse_stage_tag(tag: &str) -> Option<(Digest256, u64)> {
    let (sig_part, unique_id_part) = tag.split_once('-')?;
    let signature: Digest256 = sig_part.parse().ok()?;
    let unique_id: u64 = unique_id_part.parse().ok()?;
    Some((signature, unique_id))
}

pub fn managed_image_tag(image_name: &str) -> String {
    format!("{MANAGED_IMAGE_PREFIX}{}", slug(image_name))
}

pub fn parse_managed_image_tag(tag: &str) -> Option<String> {
    tag.strip_prefix(MANAGED_IMAGE_PREFIX).map(unslug)
}

pub fn image_metadata_by_commit_tag(image_name: &str, commit: &str) -> String {
    format!("{IMAGE_METADATA_BY_COMMIT_PREFIX}{}-{commit}", slug(image_name))
}

/// Parse a commit-metadata tag back into (image name, commit). The commit
/// is assumed not to contain `-`, matching the original encoding's own
/// last-dash-delimited assumption for git SHAs and short refs.
pub fn parse_image_metadata_by_commit_tag(tag: &str) -> Option<(String, String)> {
    let rest = tag.strip_prefix(IMAGE_METADATA_BY_COMMIT_PREFIX)?;
    let (slugged_image, commit) = rest.rsplit_once('-')?;
    Some((unslug(slugged_image), commit.to_string()))
}

pub fn client_id_tag(client_id: &str, timestamp_millis: i64) -> String {
    format!("{CLIENT_ID_PREFIX}{client_id}-{timestamp_millis}")
}

pub fn parse_client_id_tag(tag: &str) -> Option<(String, i64)> {
    let rest = tag.strip_prefix(CLIENT_ID_PREFIX)?;
    let (client_id, timestamp_part) = rest.rsplit_once('-')?;
    let timestamp_millis: i64 = timestamp_part.parse().ok()?;
    Some((client_id.to_string(), timestamp_millis))
}
