//! Deterministic storage paths for corpus images.
//!
//! Every image lives at `class/vendor/device/<sha256>:<filename>` below the
//! corpus root. Segments are escaped one by one so that no metadata value can
//! add, remove, or climb path components.
use crate::manifest::ManifestRow;

/// Escape a single path segment.
///
/// `%` is escaped first so the mapping stays injective, then `/`. Segments
/// made only of `.` or `..` have their dots escaped.
pub fn escape_segment(segment: &str) -> String {
    if segment == "." || segment == ".." {
        return segment.replace('.', "%2e");
    }
    segment.replace('%', "%25").replace('/', "%2f")
}

/// Escaped segments of the relative image path, outermost first.
pub fn image_rel_segments(row: &ManifestRow) -> [String; 4] {
    [
        escape_segment(&row.class),
        escape_segment(&row.vendor),
        escape_segment(&row.device),
        escape_segment(&format!("{}:{}", row.sha256, row.filename)),
    ]
}

/// Relative image path joined with `/`, as used in job lists and reports.
pub fn image_rel_path(row: &ManifestRow) -> String {
    image_rel_segments(row).join("/")
}
