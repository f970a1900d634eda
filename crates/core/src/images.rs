//! Image file recognition for engine output.

use std::path::Path;

/// Extensions (lowercase, without dot) treated as rendered images.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// Whether `path` has one of the [`IMAGE_EXTENSIONS`], case-insensitively.
pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}
