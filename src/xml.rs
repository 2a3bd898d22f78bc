//! S3 XML bodies.
//!
//! Responses are rendered with `quick-xml`'s event writer; the two request
//! bodies the gateway accepts as XML (`CompleteMultipartUpload` here, the
//! `AccessControlPolicy` in [`crate::acl`]) are parsed with its reader.

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::acl::{Acl, Grantee, Owner};
use crate::errors::S3Error;
use crate::handlers::{ListVersion, ObjectListing};
use crate::multipart::{CompletedPart, PartListing};
use crate::store::backend::{BucketRecord, ObjectRecord};

const S3_NAMESPACE: &str = "http://s3.amazonaws.com/doc/2006-03-01/";
const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

/// Format a timestamp the way S3 XML bodies carry it.
pub fn iso8601(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Small wrapper over a `quick_xml::Writer` writing into memory.
struct XmlDoc {
    writer: Writer<Vec<u8>>,
}

impl XmlDoc {
    fn new() -> Self {
        let mut writer = Writer::new(Vec::new());
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .expect("xml decl");
        Self { writer }
    }

    /// Open the namespaced root element.
    fn root(&mut self, tag: &str) {
        let root = BytesStart::new(tag).with_attributes([("xmlns", S3_NAMESPACE)]);
        self.writer.write_event(Event::Start(root)).expect("start root");
    }

    fn start(&mut self, tag: &str) {
        self.writer
            .write_event(Event::Start(BytesStart::new(tag)))
            .expect("start element");
    }

    fn end(&mut self, tag: &str) {
        self.writer
            .write_event(Event::End(BytesEnd::new(tag)))
            .expect("end element");
    }

    /// Write a `<tag>text</tag>` element.
    fn text(&mut self, tag: &str, text: &str) {
        self.start(tag);
        self.writer
            .write_event(Event::Text(BytesText::new(text)))
            .expect("text");
        self.end(tag);
    }

    fn bool(&mut self, tag: &str, value: bool) {
        self.text(tag, if value { "true" } else { "false" });
    }

    /// Write a parent element containing a flat list of child text elements.
    fn group(&mut self, parent: &str, children: &[(&str, &str)]) {
        self.start(parent);
        for (tag, value) in children {
            self.text(tag, value);
        }
        self.end(parent);
    }

    fn owner(&mut self, tag: &str, owner: &Owner) {
        self.group(tag, &[("ID", &owner.id), ("DisplayName", &owner.display_name)]);
    }

    fn finish(self) -> String {
        String::from_utf8_lossy(&self.writer.into_inner()).into_owned()
    }
}

// ── Error response ──────────────────────────────────────────────────

/// Render an S3 `<Error>` document.
pub fn render_error(code: &str, message: &str, resource: &str, request_id: &str) -> String {
    let mut doc = XmlDoc::new();
    doc.group(
        "Error",
        &[
            ("Code", code),
            ("Message", message),
            ("Resource", resource),
            ("RequestId", request_id),
        ],
    );
    doc.finish()
}

// ── ListAllMyBucketsResult ──────────────────────────────────────────

pub fn render_list_buckets_result(owner: &Owner, buckets: &[BucketRecord]) -> String {
    let mut doc = XmlDoc::new();
    doc.root("ListAllMyBucketsResult");
    doc.owner("Owner", owner);

    doc.start("Buckets");
    for bucket in buckets {
        doc.group(
            "Bucket",
            &[
                ("Name", &bucket.name),
                ("CreationDate", &iso8601(&bucket.created_at)),
            ],
        );
    }
    doc.end("Buckets");

    doc.end("ListAllMyBucketsResult");
    doc.finish()
}

// ── ListBucketResult (v1 and v2) ────────────────────────────────────

/// Render `<ListBucketResult>` in the dialect the request asked for.
pub fn render_list_objects_result(listing: &ObjectListing) -> String {
    let params = &listing.params;
    let mut doc = XmlDoc::new();
    doc.root("ListBucketResult");

    doc.text("Name", &listing.bucket);
    doc.text("Prefix", &params.prefix);
    match params.version {
        ListVersion::V1 => {
            doc.text("Marker", params.marker.as_deref().unwrap_or(""));
        }
        ListVersion::V2 => {
            let key_count = listing.objects.len() + listing.common_prefixes.len();
            doc.text("KeyCount", &key_count.to_string());
            if let Some(sa) = params.marker.as_deref().filter(|s| !s.is_empty()) {
                doc.text("StartAfter", sa);
            }
            if let Some(token) = &params.continuation_token {
                doc.text("ContinuationToken", &encode_continuation_token(token));
            }
        }
    }
    if !params.delimiter.is_empty() {
        doc.text("Delimiter", &params.delimiter);
    }
    doc.text("MaxKeys", &params.max_keys.to_string());
    doc.bool("IsTruncated", listing.is_truncated);

    if let Some(next) = &listing.next_marker {
        match params.version {
            // NextMarker is only returned alongside a delimiter.
            ListVersion::V1 if !params.delimiter.is_empty() => doc.text("NextMarker", next),
            ListVersion::V1 => {}
            ListVersion::V2 => doc.text("NextContinuationToken", &encode_continuation_token(next)),
        }
    }

    for object in &listing.objects {
        write_contents(&mut doc, object);
    }

    for cp in &listing.common_prefixes {
        doc.group("CommonPrefixes", &[("Prefix", cp)]);
    }

    doc.end("ListBucketResult");
    doc.finish()
}

fn write_contents(doc: &mut XmlDoc, object: &ObjectRecord) {
    doc.group(
        "Contents",
        &[
            ("Key", &object.key),
            ("LastModified", &iso8601(&object.last_modified)),
            ("ETag", &object.etag),
            ("Size", &object.size.to_string()),
            ("StorageClass", &object.storage_class),
        ],
    );
}

/// Continuation tokens are the hex encoding of the key to resume after.
pub fn encode_continuation_token(key: &str) -> String {
    hex::encode(key.as_bytes())
}

pub fn decode_continuation_token(token: &str) -> Result<String, S3Error> {
    hex::decode(token)
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
        .ok_or_else(|| S3Error::InvalidArgument {
            message: "The continuation token provided is incorrect".to_string(),
        })
}

// ── AccessControlPolicy ────────────────────────────────────────────

pub fn render_access_control_policy(acl: &Acl) -> String {
    let mut doc = XmlDoc::new();
    doc.root("AccessControlPolicy");
    doc.owner("Owner", &acl.owner);

    doc.start("AccessControlList");
    for grant in &acl.grants {
        doc.start("Grant");

        let xsi_type = match &grant.grantee {
            Grantee::CanonicalUser { .. } => "CanonicalUser",
            Grantee::Group { .. } => "Group",
        };
        let grantee = BytesStart::new("Grantee")
            .with_attributes([("xmlns:xsi", XSI_NAMESPACE), ("xsi:type", xsi_type)]);
        doc.writer
            .write_event(Event::Start(grantee))
            .expect("start grantee");
        match &grant.grantee {
            Grantee::CanonicalUser { id, display_name } => {
                doc.text("ID", id);
                doc.text("DisplayName", display_name);
            }
            Grantee::Group { uri } => doc.text("URI", uri),
        }
        doc.end("Grantee");

        doc.text("Permission", grant.permission.as_str());
        doc.end("Grant");
    }
    doc.end("AccessControlList");

    doc.end("AccessControlPolicy");
    doc.finish()
}

// ── CopyObjectResult ────────────────────────────────────────────────

pub fn render_copy_object_result(record: &ObjectRecord) -> String {
    let mut doc = XmlDoc::new();
    doc.group(
        "CopyObjectResult",
        &[
            ("ETag", &record.etag),
            ("LastModified", &iso8601(&record.last_modified)),
        ],
    );
    doc.finish()
}

// ── Multipart ───────────────────────────────────────────────────────

pub fn render_initiate_multipart_upload_result(bucket: &str, key: &str, upload_id: &str) -> String {
    let mut doc = XmlDoc::new();
    doc.root("InitiateMultipartUploadResult");
    doc.text("Bucket", bucket);
    doc.text("Key", key);
    doc.text("UploadId", upload_id);
    doc.end("InitiateMultipartUploadResult");
    doc.finish()
}

pub fn render_complete_multipart_upload_result(
    location: &str,
    bucket: &str,
    key: &str,
    etag: &str,
) -> String {
    let mut doc = XmlDoc::new();
    doc.root("CompleteMultipartUploadResult");
    doc.text("Location", location);
    doc.text("Bucket", bucket);
    doc.text("Key", key);
    doc.text("ETag", etag);
    doc.end("CompleteMultipartUploadResult");
    doc.finish()
}

/// Render `<ListPartsResult>`.  The gateway owner doubles as initiator.
pub fn render_list_parts_result(listing: &PartListing, owner: &Owner) -> String {
    let mut doc = XmlDoc::new();
    doc.root("ListPartsResult");

    doc.text("Bucket", &listing.bucket);
    doc.text("Key", &listing.key);
    doc.text("UploadId", &listing.upload_id);
    doc.owner("Initiator", owner);
    doc.owner("Owner", owner);
    doc.text("StorageClass", &listing.storage_class);
    doc.text("PartNumberMarker", &listing.part_number_marker.to_string());
    doc.text(
        "NextPartNumberMarker",
        &listing.next_part_number_marker.to_string(),
    );
    doc.text("MaxParts", &listing.max_parts.to_string());
    doc.bool("IsTruncated", listing.is_truncated);

    for part in &listing.parts {
        doc.group(
            "Part",
            &[
                ("PartNumber", &part.part_number.to_string()),
                ("LastModified", &iso8601(&part.last_modified)),
                ("ETag", &part.etag),
                ("Size", &part.size.to_string()),
            ],
        );
    }

    doc.end("ListPartsResult");
    doc.finish()
}

/// Parse a `<CompleteMultipartUpload>` body.
///
/// The document must be a closed `<CompleteMultipartUpload>` element with
/// at least one `<Part>`.  Every part needs a numeric `<PartNumber>`;
/// `<ETag>` is optional.  Anything else is `MalformedXML`.
pub fn parse_complete_multipart_upload(body: &[u8]) -> Result<Vec<CompletedPart>, S3Error> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    const ROOT: &[u8] = b"CompleteMultipartUpload";

    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut parts = Vec::new();
    let mut part_number: Option<u32> = None;
    let mut etag: Option<String> = None;
    let mut depth = 0usize;
    let mut root_closed = false;
    let mut in_part = false;
    let mut current_tag = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                if depth == 0 && (root_closed || e.name().local_name().as_ref() != ROOT) {
                    return Err(S3Error::MalformedXML);
                }
                depth += 1;
                let tag = String::from_utf8_lossy(e.name().local_name().as_ref()).to_string();
                if tag == "Part" {
                    in_part = true;
                    part_number = None;
                    etag = None;
                } else if in_part {
                    current_tag = tag;
                }
            }
            Ok(Event::Text(ref e)) if in_part => {
                let text = e.unescape().map_err(|_| S3Error::MalformedXML)?.to_string();
                match current_tag.as_str() {
                    "PartNumber" => {
                        part_number = Some(text.parse().map_err(|_| S3Error::MalformedXML)?)
                    }
                    "ETag" => etag = Some(text),
                    _ => {}
                }
            }
            // Bare text outside any element.
            Ok(Event::Text(_)) if depth == 0 => return Err(S3Error::MalformedXML),
            Ok(Event::Empty(_)) if depth == 0 => return Err(S3Error::MalformedXML),
            Ok(Event::End(ref e)) => {
                depth = depth.saturating_sub(1);
                if e.name().local_name().as_ref() == b"Part" {
                    in_part = false;
                    let part_number = part_number.take().ok_or(S3Error::MalformedXML)?;
                    parts.push(CompletedPart {
                        part_number,
                        etag: etag.take(),
                    });
                }
                if depth == 0 {
                    root_closed = true;
                }
                current_tag.clear();
            }
            Ok(Event::Eof) => break,
            Err(_) => return Err(S3Error::MalformedXML),
            _ => {}
        }
        buf.clear();
    }

    if !root_closed || parts.is_empty() {
        return Err(S3Error::MalformedXML);
    }

    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::Acl;
    use crate::handlers::ListObjectsParams;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn object(key: &str) -> ObjectRecord {
        ObjectRecord {
            bucket: "bucket".into(),
            key: key.into(),
            size: 10,
            etag: "\"abc\"".into(),
            storage_class: "STANDARD".into(),
            content_type: "text/plain".into(),
            user_metadata: BTreeMap::new(),
            last_modified: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        }
    }

    #[test]
    fn test_iso8601_millis() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(iso8601(&ts), "2024-01-02T03:04:05.000Z");
    }

    #[test]
    fn test_render_error() {
        let xml = render_error("NoSuchKey", "The specified key does not exist", "k", "REQ1");
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<Code>NoSuchKey</Code>"));
        assert!(xml.contains("<Resource>k</Resource>"));
        assert!(xml.contains("<RequestId>REQ1</RequestId>"));
    }

    #[test]
    fn test_render_escapes_text() {
        let xml = render_error("InvalidArgument", "a < b & c", "", "R");
        assert!(xml.contains("a &lt; b &amp; c"));
    }

    #[test]
    fn test_render_list_objects_v2() {
        let listing = ObjectListing {
            bucket: "bucket".into(),
            params: ListObjectsParams {
                version: ListVersion::V2,
                delimiter: "/".into(),
                max_keys: 2,
                ..Default::default()
            },
            objects: vec![object("a.txt")],
            common_prefixes: vec!["dir/".into()],
            is_truncated: true,
            next_marker: Some("dir/".into()),
        };
        let xml = render_list_objects_result(&listing);
        assert!(xml.contains("<KeyCount>2</KeyCount>"));
        assert!(xml.contains("<IsTruncated>true</IsTruncated>"));
        assert!(xml.contains(&format!(
            "<NextContinuationToken>{}</NextContinuationToken>",
            encode_continuation_token("dir/")
        )));
        assert!(xml.contains("<Key>a.txt</Key>"));
        assert!(xml.contains("<CommonPrefixes><Prefix>dir/</Prefix></CommonPrefixes>"));
        assert!(!xml.contains("<Marker>"));
    }

    #[test]
    fn test_render_list_objects_v1() {
        let listing = ObjectListing {
            bucket: "bucket".into(),
            params: ListObjectsParams::default(),
            objects: vec![object("a.txt")],
            common_prefixes: vec![],
            is_truncated: false,
            next_marker: None,
        };
        let xml = render_list_objects_result(&listing);
        assert!(xml.contains("<Marker></Marker>"));
        assert!(xml.contains("<MaxKeys>1000</MaxKeys>"));
        assert!(!xml.contains("KeyCount"));
    }

    #[test]
    fn test_continuation_token_roundtrip() {
        let token = encode_continuation_token("photos/2024/");
        assert_eq!(decode_continuation_token(&token).unwrap(), "photos/2024/");
        assert!(decode_continuation_token("zz").is_err());
    }

    #[test]
    fn test_render_acl() {
        let acl = Acl::from_canned("public-read", &Owner::new("id1", "Name")).unwrap();
        let xml = render_access_control_policy(&acl);
        assert!(xml.contains("xsi:type=\"CanonicalUser\""));
        assert!(xml.contains("xsi:type=\"Group\""));
        assert!(xml.contains("<Permission>FULL_CONTROL</Permission>"));
        assert!(xml.contains("<Permission>READ</Permission>"));

        // What we render, we can parse back.
        let parsed = crate::acl::parse_access_control_policy(xml.as_bytes(), &Owner::default()).unwrap();
        assert_eq!(parsed, acl);
    }

    #[test]
    fn test_parse_complete_multipart_upload() {
        let xml = br#"<CompleteMultipartUpload xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Part><PartNumber>1</PartNumber><ETag>"aaa"</ETag></Part>
  <Part><PartNumber>2</PartNumber></Part>
</CompleteMultipartUpload>"#;
        let parts = parse_complete_multipart_upload(xml).unwrap();
        assert_eq!(
            parts,
            vec![
                CompletedPart {
                    part_number: 1,
                    etag: Some("\"aaa\"".into())
                },
                CompletedPart {
                    part_number: 2,
                    etag: None
                },
            ]
        );
    }

    #[test]
    fn test_parse_complete_multipart_upload_without_parts() {
        for body in [
            &b""[..],
            b"<CompleteMultipartUpload></CompleteMultipartUpload>",
            b"<CompleteMultipartUpload/>",
        ] {
            let err = parse_complete_multipart_upload(body).unwrap_err();
            assert_eq!(err.code(), "MalformedXML");
        }
    }

    #[test]
    fn test_parse_complete_multipart_upload_garbage() {
        for body in [
            &b"not xml at all"[..],
            b"<Foo><Bar/></Foo>",
            b"<Foo><Part><PartNumber>1</PartNumber></Part></Foo>",
            b"<CompleteMultipartUpload><Part><PartNumber>1</PartNumber>",
            b"<CompleteMultipartUpload><Part><PartNumber>1</PartNumber></Part>",
        ] {
            let err = parse_complete_multipart_upload(body).unwrap_err();
            assert_eq!(err.code(), "MalformedXML", "{}", String::from_utf8_lossy(body));
        }
    }

    #[test]
    fn test_parse_complete_multipart_upload_malformed() {
        let err = parse_complete_multipart_upload(
            b"<CompleteMultipartUpload><Part><PartNumber>x</PartNumber></Part></CompleteMultipartUpload>",
        )
        .unwrap_err();
        assert_eq!(err.code(), "MalformedXML");
        let err = parse_complete_multipart_upload(
            b"<CompleteMultipartUpload><Part><ETag>e</ETag></Part></CompleteMultipartUpload>",
        )
        .unwrap_err();
        assert_eq!(err.code(), "MalformedXML");
    }
}
