//! Credentials, accounts and the profiles derived from them.

pub mod accounts;
pub mod profile;

pub use accounts::AccountService;
pub use profile::{
    email_to_handle, fill_in_profile_defaults, filter_handle, intrinsic_name, user_emails,
    verified_emails_for_credential, UserEmail, VerifiedEmail,
};
