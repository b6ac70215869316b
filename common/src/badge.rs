// SVG status badges: a fixed two-tile layout, "build" on the left and the
// last run/build status on the right.

use crate::models::RunStatus;

const GREEN: &str = "#4c1";
const RED: &str = "#e05d44";
const YELLOW: &str = "#dfb317";
const GREY: &str = "#9f9f9f";

/// Label and tile color for a last-known status
pub fn label_and_color(status: Option<RunStatus>) -> (&'static str, &'static str) {
    match status {
        Some(RunStatus::Succeeded) => ("passing", GREEN),
        Some(RunStatus::Failed) => ("failing", RED),
        Some(RunStatus::Running) | Some(RunStatus::Pending) => ("running", YELLOW),
        Some(RunStatus::Cancelled) => ("cancelled", GREY),
        Some(RunStatus::Skipped) => ("skipped", GREY),
        None => ("unknown", GREY),
    }
}

/// Render the badge for a last-known status
pub fn render(status: Option<RunStatus>) -> String {
    let (label, color) = label_and_color(status);
    render_tiles("build", label, color)
}

fn render_tiles(left: &str, right: &str, color: &str) -> String {
    // Approximate text metrics: ~6px per character plus padding
    let left_width = 6 * left.len() + 10;
    let right_width = 6 * right.len() + 10;
    let total = left_width + right_width;
    format!(
        concat!(
            r##"<svg xmlns="http://www.w3.org/2000/svg" width="{total}" height="20" role="img" aria-label="{left}: {right}">"##,
            r##"<rect width="{lw}" height="20" fill="#555"/>"##,
            r##"<rect x="{lw}" width="{rw}" height="20" fill="{color}"/>"##,
            r##"<g fill="#fff" text-anchor="middle" font-family="Verdana,Geneva,DejaVu Sans,sans-serif" font-size="11">"##,
            r##"<text x="{lmid}" y="14">{left}</text>"##,
            r##"<text x="{rmid}" y="14">{right}</text>"##,
            r##"</g></svg>"##
        ),
        total = total,
        lw = left_width,
        rw = right_width,
        color = color,
        lmid = left_width / 2,
        rmid = left_width + right_width / 2,
        left = left,
        right = right,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(label_and_color(Some(RunStatus::Succeeded)), ("passing", GREEN));
        assert_eq!(label_and_color(Some(RunStatus::Failed)), ("failing", RED));
        assert_eq!(label_and_color(Some(RunStatus::Running)), ("running", YELLOW));
        assert_eq!(
            label_and_color(Some(RunStatus::Cancelled)),
            ("cancelled", GREY)
        );
        assert_eq!(label_and_color(None), ("unknown", GREY));
    }

    #[test]
    fn test_render_is_valid_svg_with_tiles() {
        let svg = render(Some(RunStatus::Succeeded));
        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert!(svg.contains(">build<"));
        assert!(svg.contains(">passing<"));
        assert!(svg.contains(GREEN));
    }

    #[test]
    fn test_render_unknown() {
        let svg = render(None);
        assert!(svg.contains(">unknown<"));
        assert!(svg.contains(GREY));
    }
}
