pub mod cli_missing;
pub mod line_buffer;
pub mod terminal;
