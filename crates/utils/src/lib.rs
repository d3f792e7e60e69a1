pub mod assets;
pub mod money;
pub mod sentry;
pub mod text;
