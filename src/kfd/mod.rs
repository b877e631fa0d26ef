pub mod channel;
pub mod device;
pub mod ioctl;
