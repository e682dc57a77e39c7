//! OTP service models

pub mod otp;
pub mod user;

pub use otp::{OtpRecord, OtpStatus, Purpose};
pub use user::User;
