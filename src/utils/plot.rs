//! Minimal raster plots for QC: curves and scatter points on a pair of axes.
//!
//! Both axes are linear. Their ranges span the finite points of every series,
//! padded by 5%, and map onto the image inside a fixed pixel margin with y
//! pointing up.

use std::path::Path;

use image::{Rgb, RgbImage};

use crate::error::Result;

const MARGIN: i64 = 40;
const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const AXIS: Rgb<u8> = Rgb([30, 30, 30]);
const GRID: Rgb<u8> = Rgb([225, 225, 225]);

const PALETTE: [Rgb<u8>; 8] = [
    Rgb([31, 119, 180]),
    Rgb([214, 39, 40]),
    Rgb([44, 160, 44]),
    Rgb([255, 127, 14]),
    Rgb([148, 103, 189]),
    Rgb([140, 86, 75]),
    Rgb([227, 119, 194]),
    Rgb([23, 190, 207]),
];

pub fn palette(i: usize) -> Rgb<u8> {
    PALETTE[i % PALETTE.len()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Line,
    Markers,
}

#[derive(Debug, Clone)]
pub struct Series {
    pub points: Vec<(f64, f64)>,
    pub color: Rgb<u8>,
    pub style: Style,
}

impl Series {
    pub fn line(points: Vec<(f64, f64)>, color: Rgb<u8>) -> Self {
        Self { points, color, style: Style::Line }
    }

    pub fn markers(points: Vec<(f64, f64)>, color: Rgb<u8>) -> Self {
        Self { points, color, style: Style::Markers }
    }
}

#[derive(Debug, Clone)]
pub struct Plot {
    width: u32,
    height: u32,
    series: Vec<Series>,
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    x: (f64, f64),
    y: (f64, f64),
}

impl Bounds {
    fn of(series: &[Series]) -> Option<Self> {
        let mut pts = series
            .iter()
            .flat_map(|s| s.points.iter())
            .filter(|(x, y)| x.is_finite() && y.is_finite());
        let &(x0, y0) = pts.next()?;
        let mut b = Bounds { x: (x0, x0), y: (y0, y0) };
        for &(x, y) in pts {
            b.x = (b.x.0.min(x), b.x.1.max(x));
            b.y = (b.y.0.min(y), b.y.1.max(y));
        }
        let pad = |(lo, hi): (f64, f64)| {
            let span = if hi > lo { hi - lo } else { 1.0 };
            (lo - 0.05 * span, hi + 0.05 * span)
        };
        Some(Bounds { x: pad(b.x), y: pad(b.y) })
    }
}

impl Plot {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, series: Vec::new() }
    }

    pub fn add(&mut self, series: Series) -> &mut Self {
        self.series.push(series);
        self
    }

    fn to_pixel(&self, b: &Bounds, (x, y): (f64, f64)) -> (i64, i64) {
        let w = (self.width as i64 - 2 * MARGIN).max(1) as f64;
        let h = (self.height as i64 - 2 * MARGIN).max(1) as f64;
        let px = MARGIN as f64 + (x - b.x.0) / (b.x.1 - b.x.0) * w;
        let py = (self.height as i64 - MARGIN) as f64 - (y - b.y.0) / (b.y.1 - b.y.0) * h;
        (px.round() as i64, py.round() as i64)
    }

    pub fn render(&self) -> RgbImage {
        let mut img = RgbImage::from_pixel(self.width, self.height, BACKGROUND);
        let (left, right) = (MARGIN, self.width as i64 - MARGIN);
        let (top, bottom) = (MARGIN, self.height as i64 - MARGIN);

        for n in 1..5 {
            let gx = left + (right - left) * n / 5;
            let gy = top + (bottom - top) * n / 5;
            draw_line(&mut img, (gx, top), (gx, bottom), GRID);
            draw_line(&mut img, (left, gy), (right, gy), GRID);
        }
        draw_line(&mut img, (left, bottom), (right, bottom), AXIS);
        draw_line(&mut img, (left, top), (left, bottom), AXIS);

        let Some(bounds) = Bounds::of(&self.series) else {
            return img;
        };
        for s in &self.series {
            let pixels: Vec<(i64, i64)> = s
                .points
                .iter()
                .filter(|(x, y)| x.is_finite() && y.is_finite())
                .map(|p| self.to_pixel(&bounds, *p))
                .collect();
            match s.style {
                Style::Line => {
                    for pair in pixels.windows(2) {
                        draw_line(&mut img, pair[0], pair[1], s.color);
                    }
                }
                Style::Markers => {
                    for p in pixels {
                        draw_marker(&mut img, p, s.color);
                    }
                }
            }
        }
        img
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.render().save(path)?;
        Ok(())
    }
}

fn put(img: &mut RgbImage, (x, y): (i64, i64), color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, color);
    }
}

/// Bresenham.
fn draw_line(img: &mut RgbImage, (mut x0, mut y0): (i64, i64), (x1, y1): (i64, i64), color: Rgb<u8>) {
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        put(img, (x0, y0), color);
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

fn draw_marker(img: &mut RgbImage, (cx, cy): (i64, i64), color: Rgb<u8>) {
    for dx in -2..=2 {
        for dy in -2..=2 {
            put(img, (cx + dx, cy + dy), color);
        }
    }
}
