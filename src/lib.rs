pub mod cancel;
pub mod codec;
pub mod config;
pub mod eventbus;
pub mod imagex;
pub mod iox;
pub mod monitor;
pub mod options;
pub mod pngmeta;
pub mod riff;
pub mod scanner;
pub mod transfer;
pub mod zipio;
