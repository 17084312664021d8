//! Path preparation: normalized strokes to integer stepper coordinates.
//!
//! Pure and deterministic, no I/O. Each stroke is closed if necessary,
//! unwrapped around the cylindrical seam so motor travel is continuous,
//! scaled into steps, and (when wrapping is enabled) shifted by whole
//! revolutions to minimize travel from the carriage's current position.

use ovoplot_common::{
    CoordinateMode, GeometryConfig, Point2D, PreparedStroke, StepPoint, Stroke,
};

/// Two points closer than this (in wrapped UV distance) count as coincident.
const CLOSE_EPSILON: f64 = 1e-6;

/// How close to the wrap boundary an endpoint must be for the seam-aware
/// unwrap to treat a wide jump as a seam crossing.
const SEAM_BAND: f64 = 0.1;

/// Prepares `strokes` for drawing, threading the carriage position from
/// `start_x` through every stroke.
///
/// Strokes with fewer than two points, or collapsing below two distinct
/// step coordinates, are dropped.
pub fn prepare_strokes(
    strokes: &[Stroke],
    config: &GeometryConfig,
    start_x: i32,
) -> Vec<PreparedStroke> {
    let mut prepared = Vec::with_capacity(strokes.len());
    let mut current_x = start_x;
    for stroke in strokes {
        if let Some(steps) = prepare_stroke(stroke, config, current_x) {
            current_x = steps[steps.len() - 1].x;
            prepared.push(steps);
        }
    }
    prepared
}

fn prepare_stroke(
    stroke: &Stroke,
    config: &GeometryConfig,
    current_x: i32,
) -> Option<PreparedStroke> {
    if stroke.points.len() < 2 {
        return None;
    }

    let mut points = stroke.points.clone();
    if stroke.closed {
        let first = points[0];
        let last = points[points.len() - 1];
        if wrapped_distance(last, first) > CLOSE_EPSILON {
            points.push(first);
        }
    }

    let unwrapped = match config.coordinate_mode {
        CoordinateMode::NormalizedUv => unwrap_seam(&points),
        CoordinateMode::DocumentPxCentered => unwrap_seam_aware(&points),
    };

    let mut steps: PreparedStroke = Vec::with_capacity(unwrapped.len());
    for point in &unwrapped {
        let step = scale_point(point, config);
        if steps.last() != Some(&step) {
            steps.push(step);
        }
    }
    if steps.len() < 2 {
        return None;
    }

    if config.wrap_around {
        align_to_carriage(&mut steps, config.steps_per_turn, current_x);
    }
    Some(steps)
}

/// Wrapped UV distance, with `u` taken modulo 1.
fn wrapped_distance(a: Point2D, b: Point2D) -> f64 {
    let mut du = b.u - a.u;
    du -= du.round();
    let dv = b.v - a.v;
    (du * du + dv * dv).sqrt()
}

/// Strict seam unwrapping: every point is shifted by the whole revolution
/// that brings it closest to its unwrapped predecessor.
fn unwrap_seam(points: &[Point2D]) -> Vec<Point2D> {
    let mut out = Vec::with_capacity(points.len());
    let mut prev = points[0].u;
    out.push(points[0]);
    for point in &points[1..] {
        let u = point.u + (prev - point.u).round();
        out.push(Point2D::new(u, point.v));
        prev = u;
    }
    out
}

/// Seam-aware unwrapping for document-centered strokes.
///
/// A wide jump is only treated as a seam crossing when both endpoints lie in
/// the band next to the wrap boundary; legitimate wide in-document strokes
/// pass through untouched.
fn unwrap_seam_aware(points: &[Point2D]) -> Vec<Point2D> {
    let near_boundary = |u: f64| u <= SEAM_BAND || u >= 1.0 - SEAM_BAND;

    let mut out = Vec::with_capacity(points.len());
    let mut offset = 0.0;
    let mut prev_raw = points[0].u;
    out.push(points[0]);
    for point in &points[1..] {
        let jump = point.u - prev_raw;
        if jump.abs() > 0.5 && near_boundary(point.u) && near_boundary(prev_raw) {
            offset -= jump.round();
        }
        out.push(Point2D::new(point.u + offset, point.v));
        prev_raw = point.u;
    }
    out
}

fn scale_point(point: &Point2D, config: &GeometryConfig) -> StepPoint {
    let half_range = config.pen_range_steps / 2;
    match config.coordinate_mode {
        CoordinateMode::NormalizedUv => {
            let x = (point.u * f64::from(config.steps_per_turn)).round() as i32;
            let y = ((0.5 - point.v) * f64::from(config.pen_range_steps)).round() as i32;
            StepPoint::new(x, y.clamp(-half_range, half_range))
        }
        CoordinateMode::DocumentPxCentered => {
            let width_factor = 2.0 * config.document_width_px / config.step_scaling_factor;
            let height_factor = 2.0 * config.document_height_px / config.step_scaling_factor;
            let x = ((point.u - 0.5) * width_factor).round() as i32;
            let y = ((point.v - 0.5) * height_factor).round() as i32;
            StepPoint::new(x, y.clamp(-half_range, half_range))
        }
    }
}

/// Shifts the stroke along X by the multiple of the wrap period nearest to
/// the carriage, so multi-revolution travel stays minimal.
fn align_to_carriage(steps: &mut PreparedStroke, steps_per_turn: i32, current_x: i32) {
    let period = f64::from(steps_per_turn);
    let turns = (f64::from(current_x - steps[0].x) / period).round() as i32;
    if turns != 0 {
        let shift = turns * steps_per_turn;
        for step in steps.iter_mut() {
            step.x += shift;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovoplot_common::GeometryConfig;

    fn uv_config(steps_per_turn: i32, pen_range_steps: i32) -> GeometryConfig {
        GeometryConfig {
            steps_per_turn,
            pen_range_steps,
            wrap_around: false,
            ..GeometryConfig::default()
        }
    }

    #[test]
    fn simple_stroke_scales_to_steps() {
        let strokes = [Stroke::open(vec![
            Point2D::new(0.0, 0.5),
            Point2D::new(0.1, 0.5),
        ])];
        let prepared = prepare_strokes(&strokes, &uv_config(3200, 1500), 0);
        assert_eq!(
            prepared,
            vec![vec![StepPoint::new(0, 0), StepPoint::new(320, 0)]]
        );
    }

    #[test]
    fn preparation_is_deterministic() {
        let strokes = [
            Stroke::closed(vec![
                Point2D::new(0.95, 0.2),
                Point2D::new(0.05, 0.4),
                Point2D::new(0.15, 0.6),
            ]),
            Stroke::open(vec![Point2D::new(0.6, 0.1), Point2D::new(0.7, 0.9)]),
        ];
        let config = GeometryConfig::default();
        let first = prepare_strokes(&strokes, &config, 123);
        let second = prepare_strokes(&strokes, &config, 123);
        assert_eq!(first, second);
    }

    #[test]
    fn y_is_clamped_to_half_pen_range() {
        let strokes = [Stroke::open(vec![
            Point2D::new(0.0, -2.0),
            Point2D::new(0.1, 4.0),
        ])];
        let prepared = prepare_strokes(&strokes, &uv_config(3200, 400), 0);
        assert_eq!(prepared[0][0].y, 200);
        assert_eq!(prepared[0][1].y, -200);
    }

    #[test]
    fn closed_stroke_gains_exact_closing_point() {
        let strokes = [Stroke::closed(vec![
            Point2D::new(0.0, 0.3),
            Point2D::new(0.2, 0.3),
            Point2D::new(0.2, 0.6),
        ])];
        let config = uv_config(1000, 1000);
        let prepared = prepare_strokes(&strokes, &config, 0);
        let stroke = &prepared[0];
        assert_eq!(stroke.len(), 4);
        assert_eq!(stroke[0], stroke[3]);
    }

    #[test]
    fn already_closed_stroke_is_untouched() {
        let strokes = [Stroke::closed(vec![
            Point2D::new(0.1, 0.3),
            Point2D::new(0.3, 0.3),
            Point2D::new(0.1, 0.3),
        ])];
        let prepared = prepare_strokes(&strokes, &uv_config(1000, 1000), 0);
        assert_eq!(prepared[0].len(), 3);
    }

    #[test]
    fn seam_crossing_chooses_nearest_candidate() {
        let points = vec![
            Point2D::new(0.95, 0.5),
            Point2D::new(0.02, 0.5),
            Point2D::new(0.1, 0.5),
            Point2D::new(0.98, 0.5),
        ];
        let unwrapped = unwrap_seam(&points);
        // 0.02 is pulled up to 1.02, and 0.98 back down to match 1.1's side.
        assert!((unwrapped[1].u - 1.02).abs() < 1e-12);
        assert!((unwrapped[2].u - 1.1).abs() < 1e-12);
        assert!((unwrapped[3].u - 0.98).abs() < 1e-12);
        // every chosen u is the best of {u-1, u, u+1} against its predecessor
        for pair in unwrapped.windows(2).zip(points.windows(2)) {
            let (prev, chosen) = (pair.0[0].u, pair.0[1].u);
            let raw = pair.1[1].u;
            let best = [raw - 1.0, raw, raw + 1.0]
                .into_iter()
                .fold(f64::INFINITY, |acc, cand| acc.min((cand - prev).abs()));
            assert!(((chosen - prev).abs() - best).abs() < 1e-12);
        }
    }

    #[test]
    fn document_mode_centers_on_document_origin() {
        let config = GeometryConfig {
            coordinate_mode: CoordinateMode::DocumentPxCentered,
            document_width_px: 1209.448,
            document_height_px: 377.952,
            step_scaling_factor: 2.0,
            wrap_around: false,
            ..GeometryConfig::default()
        };
        let strokes = [Stroke::open(vec![
            Point2D::new(0.0, 0.0),
            Point2D::new(1.0, 1.0),
        ])];
        let prepared = prepare_strokes(&strokes, &config, 0);
        assert_eq!(
            prepared,
            vec![vec![StepPoint::new(-605, -189), StepPoint::new(605, 189)]]
        );
    }

    #[test]
    fn seam_aware_unwrap_ignores_wide_interior_strokes() {
        // A wide jump away from the boundary is a real stroke, not a seam.
        let interior = vec![Point2D::new(0.2, 0.5), Point2D::new(0.8, 0.5)];
        let unwrapped = unwrap_seam_aware(&interior);
        assert_eq!(unwrapped[1].u, 0.8);

        // The same jump hugging the boundary is a seam crossing.
        let seam = vec![Point2D::new(0.95, 0.5), Point2D::new(0.05, 0.5)];
        let unwrapped = unwrap_seam_aware(&seam);
        assert!((unwrapped[1].u - 1.05).abs() < 1e-12);
    }

    #[test]
    fn alignment_shifts_by_nearest_wrap_period() {
        let config = GeometryConfig {
            steps_per_turn: 3200,
            pen_range_steps: 1500,
            wrap_around: true,
            ..GeometryConfig::default()
        };
        let strokes = [Stroke::open(vec![
            Point2D::new(0.1, 0.5),
            Point2D::new(0.2, 0.5),
        ])];
        // Carriage sits two revolutions out; the stroke follows it there.
        let prepared = prepare_strokes(&strokes, &config, 6500);
        let start = prepared[0][0];
        assert_eq!(start.x, 320 + 2 * 3200);
        assert_eq!(start.x.rem_euclid(3200), 320);
        // and the offset is the multiple of the period nearest the carriage
        let offset = start.x - 320;
        assert_eq!(offset, 2 * 3200);
    }

    #[test]
    fn current_x_threads_across_strokes() {
        let config = GeometryConfig {
            steps_per_turn: 1000,
            pen_range_steps: 1000,
            wrap_around: true,
            ..GeometryConfig::default()
        };
        let strokes = [
            Stroke::open(vec![Point2D::new(0.0, 0.5), Point2D::new(0.9, 0.5)]),
            Stroke::open(vec![Point2D::new(0.0, 0.5), Point2D::new(0.1, 0.5)]),
        ];
        let prepared = prepare_strokes(&strokes, &config, 0);
        // Second stroke aligns against the first stroke's end (x = 900), so
        // its start lands at 1000, not back at 0.
        assert_eq!(prepared[0][1].x, 900);
        assert_eq!(prepared[1][0].x, 1000);
    }

    #[test]
    fn degenerate_strokes_are_dropped() {
        let config = uv_config(3200, 1500);
        let strokes = [
            Stroke::open(vec![Point2D::new(0.5, 0.5)]),
            Stroke::open(vec![Point2D::new(0.5, 0.5), Point2D::new(0.50001, 0.5)]),
            Stroke::open(vec![Point2D::new(0.0, 0.5), Point2D::new(0.5, 0.5)]),
        ];
        let prepared = prepare_strokes(&strokes, &config, 0);
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0][1].x, 1600);
    }
}
