use std::io;

/// Types that can be decoded from the body of a framed message.
pub trait Deserialize<'a>: Sized {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}
