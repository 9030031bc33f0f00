//! Named window presets offered by the delivery API.

use serde::Serialize;

/// A named (window width, window center) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowPreset {
    pub name: &'static str,
    #[serde(rename = "ww")]
    pub window_width: f64,
    #[serde(rename = "wl")]
    pub window_center: f64,
}

pub static WINDOW_PRESETS: &[WindowPreset] = &[
    WindowPreset { name: "lung", window_width: 1500.0, window_center: -600.0 },
    WindowPreset { name: "bone", window_width: 2000.0, window_center: 300.0 },
    WindowPreset { name: "soft-tissue", window_width: 400.0, window_center: 40.0 },
    WindowPreset { name: "brain", window_width: 100.0, window_center: 50.0 },
    WindowPreset { name: "liver", window_width: 200.0, window_center: 50.0 },
    WindowPreset { name: "chest-xray", window_width: 2500.0, window_center: 500.0 },
    WindowPreset { name: "bone-xray", window_width: 4000.0, window_center: 2000.0 },
    WindowPreset { name: "abdomen", window_width: 350.0, window_center: 50.0 },
];

/// Look up a preset by name, case-insensitively.
pub fn find_preset(name: &str) -> Option<&'static WindowPreset> {
    WINDOW_PRESETS
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case("lung", Some((1500.0, -600.0)))]
    #[case("LUNG", Some((1500.0, -600.0)))]
    #[case("Soft-Tissue", Some((400.0, 40.0)))]
    #[case("bone-xray", Some((4000.0, 2000.0)))]
    #[case("sepia", None)]
    fn test_find_preset(#[case] name: &str, #[case] expected: Option<(f64, f64)>) {
        let found = find_preset(name).map(|p| (p.window_width, p.window_center));
        assert_eq!(found, expected);
    }
}
