// Hand-rolled HTTP/1.1 framing
pub mod buffer;
pub mod codec;
pub mod io;

pub use buffer::BufferPool;
pub use codec::RequestHead;
