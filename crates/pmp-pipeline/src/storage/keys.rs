//! Object key layout
//!
//! ```text
//! protocols/{protocol_id}/photos/original/{photo_id}.{ext}
//! protocols/{protocol_id}/photos/{thumb|gallery|pdf}/{photo_id}.{ext}
//! protocols/{protocol_id}/manifest_{hash16}.json
//! protocols/{protocol_id}/pdf/migrated_{hash16}.pdf
//! ```
//!
//! Keys depend only on ids and content hashes, so a retried job writes to
//! the same keys it wrote before. Everything for one protocol shares the
//! `protocols/{protocol_id}/` prefix.

use pmp_common::{DerivativeKind, Renditions};
use uuid::Uuid;

const DOMAIN: &str = "protocols";
const HASH_PREFIX_LEN: usize = 16;

pub fn protocol_prefix(protocol_id: Uuid) -> String {
    format!("{DOMAIN}/{protocol_id}/")
}

pub fn original_key(protocol_id: Uuid, photo_id: Uuid, extension: &str) -> String {
    format!("{DOMAIN}/{protocol_id}/photos/original/{photo_id}.{extension}")
}

pub fn derivative_key(protocol_id: Uuid, photo_id: Uuid, kind: DerivativeKind) -> String {
    format!(
        "{DOMAIN}/{protocol_id}/photos/{}/{photo_id}.{}",
        kind.as_str(),
        kind.extension()
    )
}

pub fn derivative_keys(protocol_id: Uuid, photo_id: Uuid) -> Renditions<String> {
    Renditions {
        thumb: derivative_key(protocol_id, photo_id, DerivativeKind::Thumb),
        gallery: derivative_key(protocol_id, photo_id, DerivativeKind::Gallery),
        pdf: derivative_key(protocol_id, photo_id, DerivativeKind::Pdf),
    }
}

pub fn manifest_key(protocol_id: Uuid, manifest_hash: &str) -> String {
    format!("{DOMAIN}/{protocol_id}/manifest_{}.json", hash_prefix(manifest_hash))
}

pub fn migrated_pdf_key(protocol_id: Uuid, pdf_hash: &str) -> String {
    format!("{DOMAIN}/{protocol_id}/pdf/migrated_{}.pdf", hash_prefix(pdf_hash))
}

fn hash_prefix(hash: &str) -> &str {
    hash.get(..HASH_PREFIX_LEN).unwrap_or(hash)
}

/// File extension used for an accepted upload MIME type
pub fn extension_for_mime(mime_type: &str) -> Option<&'static str> {
    let parsed: mime::Mime = mime_type.trim().parse().ok()?;
    if parsed.type_() != mime::IMAGE {
        return None;
    }
    match parsed.subtype().as_str() {
        "jpeg" | "jpg" => Some("jpg"),
        "png" => Some("png"),
        "webp" => Some("webp"),
        "tiff" => Some("tiff"),
        _ => None,
    }
}

/// Best-effort content type from a key's extension
pub fn content_type_for_key(key: &str) -> &'static str {
    match key.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("tiff" | "tif") => "image/tiff",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (Uuid, Uuid) {
        (
            Uuid::parse_str("7f8c1c3e-8d4b-4b0a-9d55-0c6f1f2a9b10").unwrap(),
            Uuid::parse_str("0a1b2c3d-4e5f-4a6b-8c7d-9e0f1a2b3c4d").unwrap(),
        )
    }

    #[test]
    fn test_photo_keys_are_deterministic() {
        let (protocol_id, photo_id) = ids();
        let keys = derivative_keys(protocol_id, photo_id);

        assert_eq!(
            keys.thumb,
            "protocols/7f8c1c3e-8d4b-4b0a-9d55-0c6f1f2a9b10/photos/thumb/0a1b2c3d-4e5f-4a6b-8c7d-9e0f1a2b3c4d.webp"
        );
        assert!(keys.gallery.ends_with("/photos/gallery/0a1b2c3d-4e5f-4a6b-8c7d-9e0f1a2b3c4d.jpg"));
        assert!(keys.pdf.ends_with("/photos/pdf/0a1b2c3d-4e5f-4a6b-8c7d-9e0f1a2b3c4d.jpg"));
        assert_eq!(keys, derivative_keys(protocol_id, photo_id));

        for (_, key) in keys.iter() {
            assert!(key.starts_with(&protocol_prefix(protocol_id)));
        }
        assert!(original_key(protocol_id, photo_id, "png").starts_with(&protocol_prefix(protocol_id)));
    }

    #[test]
    fn test_hash_addressed_keys() {
        let (protocol_id, _) = ids();
        let hash = "3a7bd3e2360a3d29eea436fcfb7e44c735d117c42d1c1835420b6b9942dd4f1b";
        assert_eq!(
            manifest_key(protocol_id, hash),
            format!("protocols/{protocol_id}/manifest_3a7bd3e2360a3d29.json")
        );
        assert_eq!(
            migrated_pdf_key(protocol_id, hash),
            format!("protocols/{protocol_id}/pdf/migrated_3a7bd3e2360a3d29.pdf")
        );
        assert_eq!(manifest_key(protocol_id, "abc"), format!("protocols/{protocol_id}/manifest_abc.json"));
    }

    #[test]
    fn test_extension_for_mime() {
        assert_eq!(extension_for_mime("image/jpeg"), Some("jpg"));
        assert_eq!(extension_for_mime("image/jpg"), Some("jpg"));
        assert_eq!(extension_for_mime("image/tiff"), Some("tiff"));
        assert_eq!(extension_for_mime("image/gif"), None);
        assert_eq!(extension_for_mime("application/pdf"), None);
        assert_eq!(extension_for_mime("garbage"), None);
    }

    #[test]
    fn test_content_type_for_key() {
        assert_eq!(content_type_for_key("a/b/c.WEBP"), "image/webp");
        assert_eq!(content_type_for_key("a/manifest_x.json"), "application/json");
        assert_eq!(content_type_for_key("noext"), "application/octet-stream");
    }
}
