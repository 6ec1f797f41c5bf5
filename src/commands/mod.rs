pub mod embed;
pub mod embed_query;
pub mod preflight;
pub mod status;
