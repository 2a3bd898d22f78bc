//! Bucket access control lists.
//!
//! An ACL can arrive three ways on a bucket PUT: a canned `x-amz-acl`
//! header, explicit `x-amz-grant-*` headers, or an `AccessControlPolicy`
//! XML body.  [`resolve_acl`] picks whichever one the request carries.

use axum::http::HeaderMap;

use crate::errors::S3Error;

const ALL_USERS_URI: &str = "http://acs.amazonaws.com/groups/global/AllUsers";
const AUTHENTICATED_USERS_URI: &str = "http://acs.amazonaws.com/groups/global/AuthenticatedUsers";

/// Canonical owner of a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Owner {
    pub id: String,
    pub display_name: String,
}

impl Owner {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Permission carried by a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    FullControl,
    Read,
    Write,
    ReadAcp,
    WriteAcp,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::FullControl => "FULL_CONTROL",
            Permission::Read => "READ",
            Permission::Write => "WRITE",
            Permission::ReadAcp => "READ_ACP",
            Permission::WriteAcp => "WRITE_ACP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FULL_CONTROL" => Some(Permission::FullControl),
            "READ" => Some(Permission::Read),
            "WRITE" => Some(Permission::Write),
            "READ_ACP" => Some(Permission::ReadAcp),
            "WRITE_ACP" => Some(Permission::WriteAcp),
            _ => None,
        }
    }
}

/// Who a grant applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grantee {
    CanonicalUser { id: String, display_name: String },
    Group { uri: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub grantee: Grantee,
    pub permission: Permission,
}

impl Grant {
    fn owner_full_control(owner: &Owner) -> Self {
        Grant {
            grantee: Grantee::CanonicalUser {
                id: owner.id.clone(),
                display_name: owner.display_name.clone(),
            },
            permission: Permission::FullControl,
        }
    }

    fn group(uri: &str, permission: Permission) -> Self {
        Grant {
            grantee: Grantee::Group {
                uri: uri.to_string(),
            },
            permission,
        }
    }
}

/// An access control policy: an owner plus its grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acl {
    pub owner: Owner,
    pub grants: Vec<Grant>,
}

impl Acl {
    /// Owner FULL_CONTROL only; the default for new buckets.
    pub fn private(owner: &Owner) -> Self {
        Acl {
            owner: owner.clone(),
            grants: vec![Grant::owner_full_control(owner)],
        }
    }

    /// Expand a canned ACL name.
    pub fn from_canned(canned: &str, owner: &Owner) -> Result<Self, S3Error> {
        let mut acl = Acl::private(owner);
        match canned {
            "private" => {}
            "public-read" => acl.grants.push(Grant::group(ALL_USERS_URI, Permission::Read)),
            "public-read-write" => {
                acl.grants.push(Grant::group(ALL_USERS_URI, Permission::Read));
                acl.grants.push(Grant::group(ALL_USERS_URI, Permission::Write));
            }
            "authenticated-read" => acl
                .grants
                .push(Grant::group(AUTHENTICATED_USERS_URI, Permission::Read)),
            _ => {
                return Err(S3Error::InvalidArgument {
                    message: format!("Invalid canned ACL: {canned}"),
                });
            }
        }
        Ok(acl)
    }
}

const GRANT_HEADERS: &[(&str, Permission)] = &[
    ("x-amz-grant-full-control", Permission::FullControl),
    ("x-amz-grant-read", Permission::Read),
    ("x-amz-grant-read-acp", Permission::ReadAcp),
    ("x-amz-grant-write", Permission::Write),
    ("x-amz-grant-write-acp", Permission::WriteAcp),
];

fn has_grant_headers(headers: &HeaderMap) -> bool {
    GRANT_HEADERS
        .iter()
        .any(|(name, _)| headers.contains_key(*name))
}

/// Determine the ACL a bucket request asks for.
///
/// Returns `Ok(None)` when the request carries no ACL at all.  Mixing a
/// canned ACL with grant headers is rejected.
pub fn resolve_acl(headers: &HeaderMap, body: &[u8], owner: &Owner) -> Result<Option<Acl>, S3Error> {
    let canned = headers.get("x-amz-acl").and_then(|v| v.to_str().ok());
    let grants = has_grant_headers(headers);

    match canned {
        Some(_) if grants => Err(S3Error::InvalidArgument {
            message: "Specifying both x-amz-acl and x-amz-grant headers is not allowed".to_string(),
        }),
        Some(canned) => Acl::from_canned(canned, owner).map(Some),
        None if grants => Ok(Some(parse_grant_headers(headers, owner))),
        None if !body.is_empty() => parse_access_control_policy(body, owner).map(Some),
        None => Ok(None),
    }
}

/// Build an ACL from `x-amz-grant-*` headers.
///
/// Each header value is a comma-separated list of `id="..."` or `uri="..."`
/// grantees.  The owner always keeps FULL_CONTROL.
fn parse_grant_headers(headers: &HeaderMap, owner: &Owner) -> Acl {
    let mut acl = Acl::private(owner);

    for (header_name, permission) in GRANT_HEADERS {
        if let Some(value) = headers.get(*header_name).and_then(|v| v.to_str().ok()) {
            acl.grants.extend(
                value
                    .split(',')
                    .filter_map(|g| parse_single_grantee(g, *permission)),
            );
        }
    }

    acl
}

fn parse_single_grantee(grantee_str: &str, permission: Permission) -> Option<Grant> {
    let grantee_str = grantee_str.trim();
    let unquote = |s: &str| s.trim_matches('"').trim_matches('\'').to_string();

    if let Some(rest) = grantee_str.strip_prefix("id=") {
        let id = unquote(rest);
        Some(Grant {
            grantee: Grantee::CanonicalUser {
                display_name: id.clone(),
                id,
            },
            permission,
        })
    } else {
        grantee_str.strip_prefix("uri=").map(|rest| Grant {
            grantee: Grantee::Group { uri: unquote(rest) },
            permission,
        })
    }
}

/// Parse an `<AccessControlPolicy>` XML document.
///
/// The owner defaults to `default_owner` when the document omits it.
/// Malformed XML, unknown permissions and grants without a grantee all
/// yield `MalformedACLError`.
pub fn parse_access_control_policy(body: &[u8], default_owner: &Owner) -> Result<Acl, S3Error> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut owner = default_owner.clone();
    let mut saw_policy = false;

    let mut in_owner = false;
    let mut in_grant = false;
    let mut in_grantee = false;
    let mut current_tag = String::new();

    let mut permission = String::new();
    let mut grantee_type = String::new();
    let mut grantee_id = String::new();
    let mut grantee_display = String::new();
    let mut grantee_uri = String::new();

    let mut grants = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let raw = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let tag = local_name(&raw).to_string();

                match tag.as_str() {
                    "AccessControlPolicy" => saw_policy = true,
                    "Owner" => in_owner = true,
                    "Grant" => {
                        in_grant = true;
                        permission.clear();
                        grantee_type.clear();
                        grantee_id.clear();
                        grantee_display.clear();
                        grantee_uri.clear();
                    }
                    "Grantee" if in_grant => {
                        in_grantee = true;
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref().ends_with(b"type") {
                                grantee_type = String::from_utf8_lossy(&attr.value).to_string();
                            }
                        }
                    }
                    _ => {}
                }
                current_tag = tag;
            }
            Ok(Event::End(ref e)) => {
                let raw = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match local_name(&raw) {
                    "Owner" => in_owner = false,
                    "Grantee" => in_grantee = false,
                    "Grant" if in_grant => {
                        let permission =
                            Permission::parse(&permission).ok_or(S3Error::MalformedACLError)?;
                        let grantee = if grantee_type == "Group" || !grantee_uri.is_empty() {
                            Grantee::Group {
                                uri: std::mem::take(&mut grantee_uri),
                            }
                        } else if !grantee_id.is_empty() {
                            Grantee::CanonicalUser {
                                id: std::mem::take(&mut grantee_id),
                                display_name: std::mem::take(&mut grantee_display),
                            }
                        } else {
                            return Err(S3Error::MalformedACLError);
                        };
                        grants.push(Grant {
                            grantee,
                            permission,
                        });
                        in_grant = false;
                    }
                    _ => {}
                }
                current_tag.clear();
            }
            Ok(Event::Text(ref e)) => {
                let text = e
                    .unescape()
                    .map_err(|_| S3Error::MalformedACLError)?
                    .to_string();

                if in_grantee {
                    match current_tag.as_str() {
                        "ID" => grantee_id = text,
                        "DisplayName" => grantee_display = text,
                        "URI" => grantee_uri = text,
                        _ => {}
                    }
                } else if in_owner {
                    match current_tag.as_str() {
                        "ID" => owner.id = text,
                        "DisplayName" => owner.display_name = text,
                        _ => {}
                    }
                } else if in_grant && current_tag == "Permission" {
                    permission = text;
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return Err(S3Error::MalformedACLError),
            _ => {}
        }
        buf.clear();
    }

    if !saw_policy {
        return Err(S3Error::MalformedACLError);
    }

    Ok(Acl { owner, grants })
}

/// Strip a namespace prefix (`s3:Owner` becomes `Owner`).
fn local_name(tag: &str) -> &str {
    tag.rsplit(':').next().unwrap_or(tag)
}
