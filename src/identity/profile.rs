//! Profile defaults and read-only projections over credentials.
//!
//! Everything here is pure: callers persist whatever they change.

use chrono::SecondsFormat;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::config::ProfileSettings;
use crate::errors::AuthzResult;
use crate::models::user::{Account, Credential, Profile, Pronoun, Service};

static HANDLE_DISALLOWED: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9_]+").unwrap());

/// Local parts that usually mean "the whole domain is me".
const VANITY_LOCAL_PARTS: &[&str] = &[
    "me",
    "self",
    "contact",
    "admin",
    "administrator",
    "root",
    "info",
    "sandstorm",
    "sandstormio",
    "inbox",
    "indiegogo",
    "mail",
    "email",
];

/// Lowercases and collapses each run of characters outside `[a-z0-9_]` into one `_`.
pub fn filter_handle(handle: &str) -> String {
    HANDLE_DISALLOWED
        .replace_all(&handle.to_lowercase(), "_")
        .into_owned()
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn filtered(handle: Option<&str>) -> Option<String> {
    handle.map(filter_handle).and_then(non_empty)
}

/// Derives a handle from an email address.
pub fn email_to_handle(email: &str) -> Option<String> {
    if email.is_empty() {
        return None;
    }
    let (local, domain) = email.split_once('@').unwrap_or((email, ""));
    let base = filter_handle(local.split('+').next().unwrap_or(""));
    let labels: Vec<&str> = domain.split('.').collect();

    let handle = if labels.last() == Some(&"name") {
        filter_handle(&labels[..labels.len() - 1].join("."))
    } else if VANITY_LOCAL_PARTS.contains(&base.as_str()) {
        filter_handle(labels[0])
    } else {
        base
    };
    non_empty(handle)
}

fn field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

/// Fills in absent profile fields from the credential's service data.
pub fn fill_in_profile_defaults(
    credential: &Credential,
    profile: &mut Profile,
    settings: &ProfileSettings,
) -> AuthzResult<()> {
    let (service, data) = credential.service()?;
    let unknown = || "Name Unknown".to_string();

    match service {
        Service::Github => {
            let username = field(data, "username");
            if profile.name.is_none() {
                profile.name = Some(username.map(str::to_string).unwrap_or_else(unknown));
            }
            if profile.handle.is_none() {
                profile.handle = filtered(username).or_else(|| filtered(profile.name.as_deref()));
            }
        }
        Service::Google => {
            if profile.name.is_none() {
                profile.name = Some(field(data, "name").map(str::to_string).unwrap_or_else(unknown));
            }
            if profile.handle.is_none() {
                profile.handle = field(data, "email")
                    .and_then(email_to_handle)
                    .or_else(|| filtered(profile.name.as_deref()));
            }
            if profile.pronoun.is_none() {
                profile.pronoun = field(data, "gender").and_then(Pronoun::from_gender);
            }
        }
        Service::Oidc => {
            if profile.name.is_none() {
                profile.name = Some(field(data, "name").map(str::to_string).unwrap_or_else(unknown));
            }
            if profile.handle.is_none() {
                profile.handle = field(data, "email")
                    .and_then(email_to_handle)
                    .or_else(|| filtered(profile.name.as_deref()));
            }
        }
        Service::Email => {
            let handle = field(data, "email").and_then(email_to_handle);
            if profile.name.is_none() {
                profile.name = handle.clone();
            }
            if profile.handle.is_none() {
                profile.handle = handle;
            }
        }
        Service::Dev => {
            let name = field(data, "name").unwrap_or("");
            let first = name.split(' ').next().unwrap_or("").to_lowercase();
            if profile.name.is_none() {
                profile.name = Some(name.to_string());
            }
            if profile.handle.is_none() {
                profile.handle = non_empty(filter_handle(&first));
            }
            if profile.pronoun.is_none() {
                profile.pronoun = Some(match first.as_str() {
                    "alice" | "carol" | "eve" => Pronoun::Female,
                    "bob" | "dave" => Pronoun::Male,
                    _ => Pronoun::Neutral,
                });
            }
        }
        Service::Demo => {
            if profile.name.is_none() {
                profile.name = Some("Demo User".into());
            }
            if profile.handle.is_none() {
                profile.handle = Some("demo".into());
            }
        }
        Service::Ldap => {
            if profile.handle.is_none() {
                profile.handle = field(data, "username").map(str::to_string);
            }
            if profile.name.is_none() {
                profile.name = data
                    .get("rawAttrs")
                    .and_then(|attrs| field(attrs, &settings.ldap_name_field))
                    .map(str::to_string)
                    .or_else(|| profile.handle.clone());
            }
        }
        Service::Saml => {
            if profile.handle.is_none() {
                profile.handle = field(data, "email").and_then(email_to_handle);
            }
            if profile.name.is_none() {
                profile.name = field(data, "displayName")
                    .map(str::to_string)
                    .or_else(|| profile.handle.clone());
            }
        }
    }

    if profile.pronoun.is_none() {
        profile.pronoun = Some(Pronoun::Neutral);
    }
    if profile.identicon.is_none() {
        profile.identicon = Some(credential.id.clone());
    }
    Ok(())
}

/// The name shown to other users as proof of who this credential is.
pub fn intrinsic_name(credential: &Credential, use_private: bool) -> AuthzResult<Option<String>> {
    let (service, data) = credential.service()?;
    let name = match service {
        Service::Github => field(data, "username").map(str::to_string),
        Service::Google if use_private => field(data, "email").map(str::to_string),
        Service::Google => field(data, "name").map(str::to_string),
        Service::Oidc => field(data, "id").map(str::to_string),
        Service::Email => field(data, "email").map(str::to_string),
        Service::Dev => field(data, "name").map(str::to_string),
        Service::Demo => credential.created_at.map(|t| {
            let date = t.to_rfc3339_opts(SecondsFormat::Secs, true);
            format!("demo on {}", &date[..10])
        }),
        Service::Ldap => field(data, "username").map(str::to_string),
        Service::Saml => field(data, "id").map(str::to_string),
    };
    Ok(name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedEmail {
    pub email: String,
    pub primary: bool,
}

fn single_primary(email: Option<&str>) -> Vec<VerifiedEmail> {
    email
        .map(|e| {
            vec![VerifiedEmail {
                email: e.to_string(),
                primary: true,
            }]
        })
        .unwrap_or_default()
}

/// Addresses the credential's service has vouched for.
pub fn verified_emails_for_credential(
    credential: &Credential,
    settings: &ProfileSettings,
) -> AuthzResult<Vec<VerifiedEmail>> {
    let (service, data) = credential.service()?;
    Ok(match service {
        Service::Google => {
            if data.get("verified_email").and_then(Value::as_bool) == Some(true) {
                single_primary(field(data, "email"))
            } else {
                Vec::new()
            }
        }
        Service::Oidc | Service::Email | Service::Saml => single_primary(field(data, "email")),
        Service::Github => data
            .get("emails")
            .and_then(Value::as_array)
            .map(|emails| {
                emails
                    .iter()
                    .filter(|e| e.get("verified").and_then(Value::as_bool) == Some(true))
                    .filter_map(|e| {
                        Some(VerifiedEmail {
                            email: field(e, "email")?.to_string(),
                            primary: e.get("primary").and_then(Value::as_bool).unwrap_or(false),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default(),
        Service::Ldap => single_primary(
            data.get("rawAttrs")
                .and_then(|attrs| field(attrs, &settings.ldap_email_field)),
        ),
        Service::Dev | Service::Demo => Vec::new(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserEmail {
    pub email: String,
    pub verified: bool,
    pub primary: bool,
}

/// Every address linked to the account, verified ones first. At most one is primary: the
/// account's `primaryEmail` if verified, otherwise the first entry.
pub fn user_emails(
    account: &Account,
    credentials: &[Credential],
    settings: &ProfileSettings,
) -> AuthzResult<Vec<UserEmail>> {
    let mut verified: Vec<String> = Vec::new();
    let mut unverified: Vec<String> = Vec::new();
    for credential in credentials {
        for e in verified_emails_for_credential(credential, settings)? {
            if !verified.contains(&e.email) {
                verified.push(e.email);
            }
        }
        if let Some(e) = &credential.unverified_email {
            if !unverified.contains(e) {
                unverified.push(e.clone());
            }
        }
    }

    let primary = account.primary_email.as_deref();
    let mut result: Vec<UserEmail> = verified
        .iter()
        .map(|e| UserEmail {
            email: e.clone(),
            verified: true,
            primary: Some(e.as_str()) == primary,
        })
        .collect();
    result.extend(
        unverified
            .into_iter()
            .filter(|e| !verified.contains(e))
            .map(|email| UserEmail {
                email,
                verified: false,
                primary: false,
            }),
    );

    let primary_is_verified = primary.map_or(false, |p| verified.iter().any(|e| e == p));
    if !primary_is_verified {
        if let Some(first) = result.first_mut() {
            first.primary = true;
        }
    }
    Ok(result)
}
