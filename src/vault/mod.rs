pub mod admin;
pub mod admin_account;
pub mod artifact;
pub mod backup_service;
pub mod catalog;
pub mod checksum;
pub mod compress;
pub mod config;
pub mod driver;
pub mod encrypt;
pub mod engine;
pub mod file_ext;
pub mod finish;
pub mod import;
pub mod jobs;
pub mod maintenance;
pub mod model;
pub mod redacted;
pub mod registry;
pub mod restore;
pub mod result_error;
pub mod retention;
pub mod setup;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
