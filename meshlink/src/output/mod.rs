use comfy_table::Table;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Json,
    Table,
}

/// Print a one-shot result. Table callers render their own layout and only
/// reach here for JSON.
pub fn print_output<T: Serialize>(data: T, format: OutputFormat) {
    let rendered = match format {
        OutputFormat::Json => serde_json::to_string_pretty(&data),
        OutputFormat::Table => serde_json::to_string(&data),
    };
    if let Ok(json) = rendered {
        println!("{json}");
    }
}

/// Print one record of a stream as a single JSON line
pub fn print_json_line<T: Serialize>(data: &T) {
    if let Ok(line) = serde_json::to_string(data) {
        println!("{line}");
    }
}

pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(comfy_table::presets::UTF8_FULL)
        .apply_modifier(comfy_table::modifiers::UTF8_ROUND_CORNERS);
    table
}
