//! Sysfs GPIO and LED access.
//!
//! Only already-exported lines are listed; this surface never exports or
//! unexports anything. Writes go to whatever sysfs value file the caller
//! names, which covers both `gpioN/value` and `leds/*/brightness`.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

const GPIO_CLASS: &str = "/sys/class/gpio";
const LED_CLASS: &str = "/sys/class/leds";

/// One readable sysfs line: its value file, a short label, and the current
/// trimmed contents.
#[derive(Debug, Clone, Serialize)]
pub struct SysfsEntry {
    pub path: String,
    pub label: String,
    pub value: String,
}

/// Write `0` or `1` to a sysfs value file. Permissions of the existing file
/// are left alone.
pub fn write_value(path: &str, value: u8) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new().write(true).open(path)?;
    file.write_all(value.to_string().as_bytes())
}

/// Exported GPIOs: every `/sys/class/gpio/<name>/value` except the
/// `gpiochip*` controllers and the export/unexport knobs.
pub fn list_gpio() -> Vec<SysfsEntry> {
    list_class(Path::new(GPIO_CLASS), "value", |name| {
        name.starts_with("gpiochip") || name == "export" || name == "unexport"
    })
}

/// LEDs: every `/sys/class/leds/<name>/brightness`.
pub fn list_leds() -> Vec<SysfsEntry> {
    list_class(Path::new(LED_CLASS), "brightness", |_| false)
}

fn list_class(base: &Path, value_file: &str, skip: impl Fn(&str) -> bool) -> Vec<SysfsEntry> {
    let Ok(entries) = fs::read_dir(base) else { return Vec::new() };

    let mut out: Vec<SysfsEntry> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if skip(&name) {
                return None;
            }
            let value_path = base.join(&name).join(value_file);
            let value = fs::read_to_string(&value_path)
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            Some(SysfsEntry {
                path: value_path.to_string_lossy().into_owned(),
                label: name,
                value,
            })
        })
        .collect();

    out.sort_by(|a, b| a.label.cmp(&b.label));
    out
}
