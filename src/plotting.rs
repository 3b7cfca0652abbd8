use textplots::{Chart, Plot, Shape};

use crate::types::{AcquisitionResult, QFactorResult};

/// Pick a display unit for frequencies up to `max_hz`
fn determine_scale(max_hz: f64) -> (f64, &'static str) {
    if max_hz >= 1e9 {
        (1e-9, "GHz")
    } else if max_hz >= 1e6 {
        (1e-6, "MHz")
    } else if max_hz >= 1e3 {
        (1e-3, "kHz")
    } else {
        (1.0, "Hz")
    }
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}

/// Plot magnitude against frequency in the terminal
///
/// # Examples
/// ```
/// use rusty_sweep::AcquisitionResult;
/// use rusty_sweep::plotting::plot_trace;
///
/// let trace = AcquisitionResult::new(
///     vec![-40.0, -20.0, -40.0],
///     vec![0.0; 3],
///     vec![0.99e6, 1.0e6, 1.01e6],
/// ).unwrap();
/// plot_trace(&trace, Some("Resonance"), None, None).unwrap();
/// ```
pub fn plot_trace(
    result: &AcquisitionResult,
    title: Option<&str>,
    width: Option<usize>,
    height: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    plot_with_overlay(result, None, title, width, height)
}

/// Plot a trace with the fitted Lorentzian drawn over it
pub fn plot_fit(
    result: &AcquisitionResult,
    fit: &QFactorResult,
    width: Option<usize>,
    height: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let title = if fit.fit_succeeded {
        format!(
            "Q = {:.1} at {:.3} Hz (FWHM {:.3} Hz, R² {:.3})",
            fit.q_value, fit.center_frequency, fit.fwhm, fit.r_squared
        )
    } else {
        "Q-factor fit failed".to_string()
    };
    let overlay = fit.fit_succeeded.then_some(fit.fitted_curve.as_slice());
    plot_with_overlay(result, overlay, Some(&title), width, height)
}

fn plot_with_overlay(
    result: &AcquisitionResult,
    overlay: Option<&[(f64, f64)]>,
    title: Option<&str>,
    width: Option<usize>,
    height: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    if result.is_empty() {
        return Err("Cannot plot empty acquisition".into());
    }

    let width = width.unwrap_or(140);
    let height = height.unwrap_or(60);

    let (f_min, f_max) = bounds(result.frequency().iter().copied());
    let (m_min, m_max) = bounds(result.magnitude().iter().copied());
    let (scale, unit) = determine_scale(f_max.abs().max(f_min.abs()));

    let frame: Vec<(f32, f32)> = result
        .rows()
        .map(|(f, m, _)| ((f * scale) as f32, m as f32))
        .collect();
    let fitted: Vec<(f32, f32)> = overlay
        .unwrap_or_default()
        .iter()
        .map(|&(f, m)| ((f * scale) as f32, m as f32))
        .collect();

    println!("{}", title.unwrap_or("Magnitude"));
    println!("X-axis: Frequency ({unit}) | Y-axis: Magnitude (dBm)");
    println!(
        "{} points | {:.4} to {:.4} {unit} | {:.2} to {:.2} dBm",
        result.len(),
        f_min * scale,
        f_max * scale,
        m_min,
        m_max
    );
    println!("{}", "─".repeat(width));

    // A single point gives textplots a zero-width axis
    let (x_min, x_max) = if f_max > f_min {
        ((f_min * scale) as f32, (f_max * scale) as f32)
    } else {
        ((f_min * scale) as f32 - 1.0, (f_max * scale) as f32 + 1.0)
    };

    if fitted.is_empty() {
        Chart::new(width as u32, height as u32, x_min, x_max)
            .lineplot(&Shape::Lines(&frame))
            .nice();
    } else {
        Chart::new(width as u32, height as u32, x_min, x_max)
            .lineplot(&Shape::Lines(&frame))
            .lineplot(&Shape::Lines(&fitted))
            .nice();
    }

    println!("Frequency ({unit}) →");
    Ok(())
}

/// Plot any (x, y) series, e.g. peak magnitude per oscillator amplitude
pub fn plot_series(
    points: &[(f64, f64)],
    title: &str,
    x_label: &str,
    y_label: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if points.is_empty() {
        return Err("Cannot plot empty data".into());
    }
    let (x_min, x_max) = bounds(points.iter().map(|p| p.0));
    let (x_min, x_max) = if x_max > x_min {
        (x_min, x_max)
    } else {
        (x_min - 1.0, x_max + 1.0)
    };
    let frame: Vec<(f32, f32)> = points.iter().map(|&(x, y)| (x as f32, y as f32)).collect();

    println!("{title}");
    println!("X-axis: {x_label} | Y-axis: {y_label}");
    Chart::new(100, 40, x_min as f32, x_max as f32)
        .lineplot(&Shape::Points(&frame))
        .nice();
    Ok(())
}
