//! Canonical default values shared by the backend, reader and tooling.

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SOCKET_PATH: &str = "~/spooltag/spooltag.sock";
pub const DEFAULT_SPOOLMAN_URL: &str = "http://localhost:7912";
pub const DEFAULT_MOONRAKER_URL: &str = "http://localhost:7125";
pub const DEFAULT_NFC_DEVICE: &str = "mock";
pub const DEFAULT_FILAMENT_NAME_TEMPLATE: &str = "{material_type} {material_name}";
pub const DEFAULT_OPENTAG3D_NAME_TEMPLATE: &str = "{material_base} {material_modifiers} - {color_name}";
/// Density used when a tag carries neither density nor weight and length.
pub const DEFAULT_DENSITY: f64 = 1.24;
pub const HTTP_TIMEOUT_SECS: u64 = 10;
pub const MAX_IPC_MESSAGE: usize = 65536;
pub const UNDEFINED_IDENTIFIER: &str = "<undefined>";
pub const OPENPRINTTAG_MIME_TYPE: &str = "application/vnd.openprinttag";
pub const OPENTAG3D_MIME_TYPE: &str = "application/opentag3d";
pub const WRITE_PROTECTED_STATUS: &str = "Tag is write protected";
pub const WRITE_FAILED_STATUS: &str = "Got error while writing";
