//! Parsers and printers shared by settings bindings.

use std::fmt::Display;

pub fn parse_string(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "enable" | "enabled" | "1" => Some(true),
        "false" | "off" | "no" | "disable" | "disabled" | "0" => Some(false),
        _ => None,
    }
}

/// Accepts `#RRGGBB`, `RRGGBB` and `0xRRGGBB`.
pub fn parse_hex_color(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    let hex = trimmed
        .strip_prefix('#')
        .or_else(|| trimmed.strip_prefix("0x"))
        .unwrap_or(trimmed);
    if hex.len() != 6 {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

pub fn print_hex_color(color: &u32) -> String {
    format!("#{:06X}", color)
}

pub fn print_display<V: Display>(value: &V) -> String {
    value.to_string()
}
