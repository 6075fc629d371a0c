//! Destination rectangle computation.

use crate::types::{AspectPolicy, DeviceGeometry, Rect, Size};

/// Inputs of [`destination_rect`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxInput {
    pub source: Size,
    pub scale: u32,
    pub aspect: AspectPolicy,
    pub device: DeviceGeometry,
    pub offset_x: i32,
    pub offset_y: i32,
}

/// Places the frame on the device surface.
///
/// Integer scaling centers `source * scale` and may produce negative
/// coordinates when the result overflows the device. A fixed ratio fills the
/// device height (its width when rotated) and shrinks to fit the other axis.
/// Offsets are applied after centering.
pub fn destination_rect(input: &LetterboxInput) -> Rect {
    let dev_w = input.device.width as i32;
    let dev_h = input.device.height as i32;

    let (w, h) = match input.aspect {
        AspectPolicy::Integer => {
            let scaled = input.source.scaled(input.scale);
            (scaled.width as i32, scaled.height as i32)
        }
        AspectPolicy::Ratio(ratio) => fit_ratio(ratio, &input.device),
        AspectPolicy::Fullscreen if input.device.rotated => (dev_h, dev_w),
        AspectPolicy::Fullscreen => (dev_w, dev_h),
    };

    Rect {
        x: (dev_w - w) / 2 + input.offset_x,
        y: (dev_h - h) / 2 + input.offset_y,
        w,
        h,
    }
}

fn fit_ratio(ratio: f64, device: &DeviceGeometry) -> (i32, i32) {
    let (long, limit) = if device.rotated {
        (device.width as i32, device.height as i32)
    } else {
        (device.height as i32, device.width as i32)
    };
    let h = long;
    let w = (f64::from(h) * ratio) as i32;
    if w > limit {
        let w = limit;
        (w, (f64::from(w) / ratio) as i32)
    } else {
        (w, h)
    }
}

/// Integer factor of the nearest-neighbour prescale used by crisp
/// sharpness: the smallest one that makes `image` cover `target` on both
/// axes, and 1 once it already does.
pub fn crisp_factor(image: Size, target: Size) -> u32 {
    let x = target.width.div_ceil(image.width.max(1));
    let y = target.height.div_ceil(image.height.max(1));
    x.max(y).max(1)
}
