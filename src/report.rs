// Human-readable rendering of an `Estimate`.

use std::fmt::Write;

use crate::pipeline::Estimate;

const UNITS: [&str; 9] = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// Format a byte count with binary units and three significant digits,
/// e.g. `1981633` -> `1.89MB`, `1024` -> `1KB`.
pub fn human_size(size: u64) -> String {
    if size == 0 {
        return "0B".to_string();
    }
    let p = ((size as f64).log2() / 10.0).floor() as usize;
    let p = p.min(UNITS.len() - 1);
    let value = size as f64 / 1024f64.powi(p as i32);
    format!("{}{}", format_significant(value, 3), UNITS[p])
}

/// `printf("%.{digits}g")` for positive finite values.
fn format_significant(value: f64, digits: usize) -> String {
    // Exponent after rounding to `digits` significant digits.
    let sci = format!("{value:.prec$e}", prec = digits - 1);
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);

    if exp < -4 || exp >= digits as i32 {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", trim_fraction(mantissa), exp.abs())
    } else {
        let decimals = (digits as i32 - 1 - exp).max(0) as usize;
        trim_fraction(&format!("{value:.decimals$}")).to_string()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

/// Insert `,` between groups of three digits: `6856415` -> `6,856,415`.
pub fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn size_line(out: &mut String, label: &str, size: u64) {
    let _ = writeln!(
        out,
        "{label}: {} bytes [{}]",
        group_thousands(size),
        human_size(size)
    );
}

/// Plain-text report printed by the CLI.
pub fn render_text(estimate: &Estimate) -> String {
    let mut out = String::from("Estimates:\n");
    size_line(&mut out, "New file size on disk", estimate.new_file_size);
    size_line(
        &mut out,
        &format!(
            "New file {} size (download size for new installs)",
            estimate.codec
        ),
        estimate.new_file_compressed_size,
    );
    size_line(
        &mut out,
        &format!(
            "{} bsdiff patch size (download size for updates from the old file)",
            estimate.codec
        ),
        estimate.patch_size,
    );
    if let Some(path) = &estimate.saved_patch {
        let _ = writeln!(out, "Patch saved to: {}", path.display());
    }
    out
}
