pub mod events;
pub mod history;
pub mod launcher;
pub mod parser;
pub mod scanner;
pub mod supervisor;
pub mod text;
