pub mod distro;
pub mod exec;
pub mod git;
pub mod paths;
pub mod privileges;
pub mod progress;
pub mod shell;
pub mod version;
