//! Coordinate transformation between normalized page space and PDF space
//!
//! Normalized rectangles use a top-left origin with every component in
//! [0, 1] relative to the page. PDF rectangles use points with a
//! bottom-left origin, offset by the page's MediaBox.

use shared_types::{ModelError, NormalizedRect};

/// Convert a normalized rectangle to PDF `[x, y, width, height]`
pub fn normalized_to_pdf(rect: &NormalizedRect, media_box: [f64; 4]) -> [f64; 4] {
    let [mb_x, mb_y, mb_width, mb_height] = media_box;

    let width = rect.width() * mb_width;
    let height = rect.height() * mb_height;
    let x = mb_x + rect.x() * mb_width;
    // Flip Y axis: the rectangle's bottom edge sits at (1 - y - h) of the page
    let y = mb_y + (1.0 - rect.y() - rect.height()) * mb_height;

    [x, y, width, height]
}

/// Convert a PDF `[x, y, width, height]` rectangle back to normalized space
pub fn pdf_to_normalized(rect: [f64; 4], media_box: [f64; 4]) -> Result<NormalizedRect, ModelError> {
    let [mb_x, mb_y, mb_width, mb_height] = media_box;
    let [x, y, width, height] = rect;

    let nx = (x - mb_x) / mb_width;
    let nw = width / mb_width;
    let nh = height / mb_height;
    let ny = 1.0 - (y - mb_y) / mb_height - nh;

    NormalizedRect::new(clamp_unit(nx), clamp_unit(ny), clamp_unit(nw), clamp_unit(nh))
}

/// Absorb floating-point drift at the page edges
fn clamp_unit(v: f64) -> f64 {
    const TOLERANCE: f64 = 1e-9;
    if (-TOLERANCE..0.0).contains(&v) {
        0.0
    } else if v > 1.0 && v <= 1.0 + TOLERANCE {
        1.0
    } else {
        v
    }
}
