//! Guacamole protocol support: instruction codec, guacd tunnel client, and
//! per-protocol connection configuration.

pub mod configuration;
pub mod instruction;
pub mod tunnel;

pub use configuration::{Configuration, Protocol};
pub use instruction::{FramingError, Instruction};
pub use tunnel::{ConnectError, Tunnel};

/// Protocol version announced to guacd during the handshake.
pub const VERSION: &str = "VERSION_1_5_0";

/// Parameter names understood by guacd. Only the subset this gateway
/// actually forwards; guacd ignores parameters a protocol plugin does not
/// declare, but we filter anyway so client-supplied attributes cannot smuggle
/// arbitrary keys.
pub mod params {
    pub const HOSTNAME: &str = "hostname";
    pub const PORT: &str = "port";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const PRIVATE_KEY: &str = "private-key";
    pub const PASSPHRASE: &str = "passphrase";

    pub const WIDTH: &str = "width";
    pub const HEIGHT: &str = "height";
    pub const DPI: &str = "dpi";

    pub const FONT_NAME: &str = "font-name";
    pub const FONT_SIZE: &str = "font-size";
    pub const COLOR_SCHEME: &str = "color-scheme";
    pub const BACKSPACE: &str = "backspace";
    pub const TERMINAL_TYPE: &str = "terminal-type";

    pub const DOMAIN: &str = "domain";
    pub const SECURITY: &str = "security";
    pub const IGNORE_CERT: &str = "ignore-cert";
    pub const RESIZE_METHOD: &str = "resize-method";
    pub const REMOTE_APP: &str = "remote-app";
    pub const REMOTE_APP_DIR: &str = "remote-app-dir";
    pub const REMOTE_APP_ARGS: &str = "remote-app-args";
    pub const COLOR_DEPTH: &str = "color-depth";
    pub const FORCE_LOSSLESS: &str = "force-lossless";
    pub const PRE_CONNECTION_ID: &str = "preconnection-id";
    pub const PRE_CONNECTION_BLOB: &str = "preconnection-blob";
    pub const ENABLE_WALLPAPER: &str = "enable-wallpaper";
    pub const ENABLE_THEMING: &str = "enable-theming";
    pub const ENABLE_FONT_SMOOTHING: &str = "enable-font-smoothing";
    pub const ENABLE_FULL_WINDOW_DRAG: &str = "enable-full-window-drag";
    pub const ENABLE_DESKTOP_COMPOSITION: &str = "enable-desktop-composition";
    pub const ENABLE_MENU_ANIMATIONS: &str = "enable-menu-animations";
    pub const DISABLE_BITMAP_CACHING: &str = "disable-bitmap-caching";
    pub const DISABLE_OFFSCREEN_CACHING: &str = "disable-offscreen-caching";

    pub const ENABLE_DRIVE: &str = "enable-drive";
    pub const DRIVE_NAME: &str = "drive-name";
    pub const DRIVE_PATH: &str = "drive-path";
    pub const CREATE_DRIVE_PATH: &str = "create-drive-path";

    pub const ENABLE_RECORDING: &str = "enable-recording";
    pub const RECORDING_PATH: &str = "recording-path";
    pub const CREATE_RECORDING_PATH: &str = "create-recording-path";

    pub const CURSOR: &str = "cursor";
    pub const SWAP_RED_BLUE: &str = "swap-red-blue";
    pub const DEST_HOST: &str = "dest-host";
    pub const DEST_PORT: &str = "dest-port";

    pub const USERNAME_REGEX: &str = "username-regex";
    pub const PASSWORD_REGEX: &str = "password-regex";
    pub const LOGIN_SUCCESS_REGEX: &str = "login-success-regex";
    pub const LOGIN_FAILURE_REGEX: &str = "login-failure-regex";

    pub const NAMESPACE: &str = "namespace";
    pub const POD: &str = "pod";
    pub const CONTAINER: &str = "container";
    pub const USE_SSL: &str = "use-ssl";
    pub const CLIENT_CERT: &str = "client-cert";
    pub const CLIENT_KEY: &str = "client-key";
    pub const CA_CERT: &str = "ca-cert";
}
