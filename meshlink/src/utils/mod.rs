use colored::*;

fn status_line(prefix: ColoredString, message: &str) {
    eprintln!("{prefix} {message}");
}

pub fn print_error(message: &str) {
    status_line("Error:".red().bold(), message);
}

pub fn print_success(message: &str) {
    status_line("✓".green().bold(), message);
}

pub fn print_warning(message: &str) {
    status_line("⚠".yellow().bold(), message);
}

pub fn print_info(message: &str) {
    status_line("ℹ".blue().bold(), message);
}

/// Signal strength coloured by link quality
pub fn format_rssi(rssi: i16) -> ColoredString {
    let text = format!("{rssi} dBm");
    match rssi {
        r if r >= -70 => text.green(),
        r if r >= -90 => text.yellow(),
        _ => text.red(),
    }
}
