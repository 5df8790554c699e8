//! FaceBoxes anchor generation and box decoding.

use crate::config::PriorConfig;

/// One anchor, normalised to the network input: centre and size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prior {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

/// Sub-cell offsets used to densify small anchors.
fn dense_offsets(min_size: u32) -> &'static [f32] {
    match min_size {
        32 => &[0.0, 0.25, 0.5, 0.75],
        64 => &[0.0, 0.5],
        _ => &[0.5],
    }
}

/// Generate anchors in the order the network emits its predictions:
/// feature map, then row, then column, then anchor size, then dense grid
/// (rows outer, columns inner).
pub fn generate(cfg: &PriorConfig, image_w: u32, image_h: u32) -> Vec<Prior> {
    let (iw, ih) = (image_w as f32, image_h as f32);
    let mut priors = Vec::new();

    for (sizes, &step) in cfg.min_sizes.iter().zip(cfg.steps.iter()) {
        let rows = image_h.div_ceil(step);
        let cols = image_w.div_ceil(step);
        let step = step as f32;

        for i in 0..rows {
            for j in 0..cols {
                for &min_size in sizes {
                    let w = min_size as f32 / iw;
                    let h = min_size as f32 / ih;
                    let offsets = dense_offsets(min_size);
                    for &oy in offsets {
                        for &ox in offsets {
                            priors.push(Prior {
                                cx: (j as f32 + ox) * step / iw,
                                cy: (i as f32 + oy) * step / ih,
                                w,
                                h,
                            });
                        }
                    }
                }
            }
        }
    }

    if cfg.clip {
        for p in &mut priors {
            p.cx = p.cx.clamp(0.0, 1.0);
            p.cy = p.cy.clamp(0.0, 1.0);
            p.w = p.w.clamp(0.0, 1.0);
            p.h = p.h.clamp(0.0, 1.0);
        }
    }
    priors
}

/// Decode regression offsets `[dx, dy, dw, dh]` against `prior` into a
/// normalised `[x1, y1, x2, y2]` box.
pub fn decode(loc: &[f32], prior: &Prior, variance: [f32; 2]) -> [f32; 4] {
    let cx = prior.cx + loc[0] * variance[0] * prior.w;
    let cy = prior.cy + loc[1] * variance[0] * prior.h;
    let w = prior.w * (loc[2] * variance[1]).exp();
    let h = prior.h * (loc[3] * variance[1]).exp();
    [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
}
