use std::{fs, path::Path};

use image::{Rgb, RgbImage};

use crate::{Result, metrics_log::MetricsLog};

const PANEL_WIDTH: u32 = 640;
const PANEL_HEIGHT: u32 = 180;
const MARGIN: u32 = 12;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const FRAME: Rgb<u8> = Rgb([90, 90, 90]);
const GRID: Rgb<u8> = Rgb([215, 215, 215]);
const RAW: Rgb<u8> = Rgb([170, 200, 235]);
const SMOOTH: Rgb<u8> = Rgb([20, 80, 170]);

/// Renders every series of `logs` in its own panel, stacked in name order, and writes the
/// result as a PNG to `save_loc`.
///
/// # Arguments
/// * `logs` - The metrics to draw.
/// * `steps_per_epoch` - Draws a vertical grid line at every epoch boundary when given.
/// * `smoothing` - The window of the trailing moving average drawn over the raw series.
/// * `save_loc` - Where to write the image, its parent directory is created if missing.
///
/// # Errors
/// An io or encoding error if the image can't be written.
pub fn pretty_plot(
    logs: &MetricsLog,
    steps_per_epoch: Option<usize>,
    smoothing: usize,
    save_loc: &Path,
) -> Result<()> {
    let panels = logs.iter().filter(|(_, values)| !values.is_empty()).count() as u32;
    if panels == 0 {
        log::debug!("nothing to plot into {}", save_loc.display());
        return Ok(());
    }

    let mut img = RgbImage::from_pixel(PANEL_WIDTH, PANEL_HEIGHT * panels, BACKGROUND);
    let series = logs.iter().filter(|(_, values)| !values.is_empty());
    for (i, (name, values)) in series.enumerate() {
        let panel = Panel::new(i as u32, values.len());
        panel.frame(&mut img, steps_per_epoch);

        let (lo, hi) = bounds(values);
        panel.line(&mut img, values, lo, hi, RAW);
        panel.line(&mut img, &moving_average(values, smoothing), lo, hi, SMOOTH);

        log::debug!("plotted {name}: {} points in [{lo}, {hi}]", values.len());
    }

    if let Some(dir) = save_loc.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }

    img.save_with_format(save_loc, image::ImageFormat::Png)?;
    Ok(())
}

/// The trailing moving average of `values` over `window` points, shorter at the start.
///
/// Non-finite values are left out of the window, a window without finite values yields NaN.
pub fn moving_average(values: &[f32], window: usize) -> Vec<f32> {
    let window = window.max(1);
    let (mut sum, mut count) = (0., 0usize);

    values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            if v.is_finite() {
                sum += v;
                count += 1;
            }
            if i >= window && values[i - window].is_finite() {
                sum -= values[i - window];
                count -= 1;
            }

            if count == 0 { f32::NAN } else { sum / count as f32 }
        })
        .collect()
}

fn bounds(values: &[f32]) -> (f32, f32) {
    let (lo, hi) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });

    if lo > hi {
        return (0., 1.);
    }

    if lo == hi {
        return (lo - 0.5, hi + 0.5);
    }

    (lo, hi)
}

/// The drawable area of one metric.
struct Panel {
    left: u32,
    top: u32,
    width: u32,
    height: u32,
    points: usize,
}

impl Panel {
    fn new(index: u32, points: usize) -> Self {
        Self {
            left: MARGIN,
            top: index * PANEL_HEIGHT + MARGIN,
            width: PANEL_WIDTH - 2 * MARGIN,
            height: PANEL_HEIGHT - 2 * MARGIN,
            points,
        }
    }

    fn x(&self, step: usize) -> u32 {
        let span = self.points.saturating_sub(1).max(1) as f32;
        self.left + ((step as f32 / span) * (self.width - 1) as f32).round() as u32
    }

    fn y(&self, value: f32, lo: f32, hi: f32) -> u32 {
        let t = ((value - lo) / (hi - lo)).clamp(0., 1.);
        self.top + ((1. - t) * (self.height - 1) as f32).round() as u32
    }

    fn frame(&self, img: &mut RgbImage, steps_per_epoch: Option<usize>) {
        if let Some(every) = steps_per_epoch.filter(|&every| every > 0) {
            for step in (every..self.points).step_by(every) {
                let x = self.x(step);
                for y in self.top..self.top + self.height {
                    img.put_pixel(x, y, GRID);
                }
            }
        }

        let (right, bottom) = (self.left + self.width - 1, self.top + self.height - 1);
        for x in self.left..=right {
            img.put_pixel(x, self.top, FRAME);
            img.put_pixel(x, bottom, FRAME);
        }
        for y in self.top..=bottom {
            img.put_pixel(self.left, y, FRAME);
            img.put_pixel(right, y, FRAME);
        }
    }

    fn line(&self, img: &mut RgbImage, values: &[f32], lo: f32, hi: f32, color: Rgb<u8>) {
        let points: Vec<_> = values
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .map(|(step, &v)| (self.x(step), self.y(v, lo, hi)))
            .collect();

        if let [(x, y)] = points.as_slice() {
            img.put_pixel(*x, *y, color);
        }

        for pair in points.windows(2) {
            let [(x0, y0), (x1, y1)] = [pair[0], pair[1]];
            let steps = x0.abs_diff(x1).max(y0.abs_diff(y1)).max(1);
            for s in 0..=steps {
                let t = s as f32 / steps as f32;
                let x = x0 as f32 + (x1 as f32 - x0 as f32) * t;
                let y = y0 as f32 + (y1 as f32 - y0 as f32) * t;
                img.put_pixel(x.round() as u32, y.round() as u32, color);
            }
        }
    }
}
