use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use log::info;

use crate::finetune::History;
use crate::BowResult;

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;
const MARGIN: f32 = 40.;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const AXES: Rgb<u8> = Rgb([0, 0, 0]);
const GRID: Rgb<u8> = Rgb([225, 225, 225]);
/// Training curve.
pub const TRAIN: Rgb<u8> = Rgb([31, 119, 180]);
/// Validation curve.
pub const VALIDATION: Rgb<u8> = Rgb([255, 127, 14]);

/// Line chart of one or more series against the epoch, with a shared y range.
pub fn plot_curves(series: &[(&[f32], Rgb<u8>)]) -> RgbImage {
    let mut img = RgbImage::from_pixel(WIDTH, HEIGHT, BACKGROUND);
    let (w, h) = (WIDTH as f32, HEIGHT as f32);
    let (left, right, top, bottom) = (MARGIN, w - MARGIN / 2., MARGIN / 2., h - MARGIN);

    let values = series.iter().flat_map(|(s, _)| s.iter().copied()).filter(|v| v.is_finite());
    let (mut lo, mut hi) = values.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() {
        lo = 0.;
        hi = 1.;
    }
    if hi - lo < f32::EPSILON {
        lo -= 0.5;
        hi += 0.5;
    }
    let epochs = series.iter().map(|(s, _)| s.len()).max().unwrap_or(0);
    let x_of = |i: usize| left + (right - left) * i as f32 / (epochs.max(2) - 1) as f32;
    let y_of = |v: f32| bottom - (bottom - top) * (v - lo) / (hi - lo);

    for k in 0..=4 {
        let y = top + (bottom - top) * k as f32 / 4.;
        draw_line_segment_mut(&mut img, (left, y), (right, y), GRID);
    }
    draw_line_segment_mut(&mut img, (left, bottom), (right, bottom), AXES);
    draw_line_segment_mut(&mut img, (left, top), (left, bottom), AXES);

    for (values, colour) in series {
        for (i, pair) in values.windows(2).enumerate() {
            if pair.iter().all(|v| v.is_finite()) {
                draw_line_segment_mut(&mut img, (x_of(i), y_of(pair[0])), (x_of(i + 1), y_of(pair[1])), *colour);
            }
        }
        for (i, v) in values.iter().enumerate().filter(|(_, v)| v.is_finite()) {
            let (x, y) = (x_of(i) as i32, y_of(*v) as i32);
            draw_filled_rect_mut(&mut img, Rect::at(x - 2, y - 2).of_size(5, 5), *colour);
        }
    }

    // legend, upper left
    for (k, (_, colour)) in series.iter().enumerate() {
        let y = top as i32 + 8 + 14 * k as i32;
        draw_filled_rect_mut(&mut img, Rect::at(left as i32 + 8, y).of_size(24, 6), *colour);
    }
    draw_hollow_rect_mut(
        &mut img,
        Rect::at(left as i32 + 4, top as i32 + 4).of_size(32, 14 * series.len().max(1) as u32 + 6),
        AXES,
    );
    img
}

/// Render accuracy and loss curves, train against validation, as
/// `accuracy.png` and `loss.png` under `dir`.
pub fn do_plotting<P: AsRef<Path>>(history: &History, dir: P) -> BowResult<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let charts = [
        ("accuracy.png", &history.acc, &history.val_acc),
        ("loss.png", &history.loss, &history.val_loss),
    ];
    let mut written = Vec::with_capacity(charts.len());
    for (file, train, validation) in charts {
        let path = dir.join(file);
        plot_curves(&[(train.as_slice(), TRAIN), (validation.as_slice(), VALIDATION)]).save(&path)?;
        info!("Wrote {:?}", path);
        written.push(path);
    }
    Ok(written)
}
