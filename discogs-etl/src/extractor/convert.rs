//! Conversion of decoded XML records into typed payloads.
//!
//! Known fields are moved into the typed record, everything else is kept in its `extra` map.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::types::{
    ArtistRecord, DataType, EntityRef, LabelRecord, LabelRef, MasterRecord, RecordPayload,
    ReleaseRecord, Track,
};

type Fields = Map<String, Value>;

/// Converts the JSON form of a record element. Returns the reason when the record is malformed.
pub fn convert_record(data_type: DataType, mut fields: Fields) -> Result<RecordPayload, String> {
    let id = take_id(&mut fields).ok_or_else(|| "record has no id".to_string())?;

    let payload = match data_type {
        DataType::Artists => RecordPayload::Artist(convert_artist(id, fields)?),
        DataType::Labels => RecordPayload::Label(convert_label(id, fields)?),
        DataType::Masters => RecordPayload::Master(convert_master(id, fields)?),
        DataType::Releases => RecordPayload::Release(convert_release(id, fields)?),
    };

    Ok(payload)
}

fn convert_artist(id: String, mut fields: Fields) -> Result<ArtistRecord, String> {
    let name = required(&mut fields, "name", &id)?;

    Ok(ArtistRecord {
        real_name: take_text(&mut fields, "realname"),
        profile: take_text(&mut fields, "profile"),
        name_variations: texts(take_list(&mut fields, "namevariations", "name")),
        aliases: entity_refs(take_list(&mut fields, "aliases", "name")),
        members: entity_refs(take_list(&mut fields, "members", "name")),
        groups: entity_refs(take_list(&mut fields, "groups", "name")),
        urls: texts(take_list(&mut fields, "urls", "url")),
        data_quality: take_text(&mut fields, "data_quality"),
        extra: into_extra(fields),
        id,
        name,
    })
}

fn convert_label(id: String, mut fields: Fields) -> Result<LabelRecord, String> {
    let name = required(&mut fields, "name", &id)?;

    Ok(LabelRecord {
        contact_info: take_text(&mut fields, "contactinfo"),
        profile: take_text(&mut fields, "profile"),
        parent_label: fields.remove("parentLabel").as_ref().and_then(entity_ref),
        sublabels: entity_refs(take_list(&mut fields, "sublabels", "label")),
        urls: texts(take_list(&mut fields, "urls", "url")),
        data_quality: take_text(&mut fields, "data_quality"),
        extra: into_extra(fields),
        id,
        name,
    })
}

fn convert_master(id: String, mut fields: Fields) -> Result<MasterRecord, String> {
    let title = required(&mut fields, "title", &id)?;

    let year = match take_text(&mut fields, "year") {
        Some(raw) => match raw.parse::<i32>() {
            Ok(year) if year > 0 => Some(year),
            Ok(_) => None,
            Err(_) => {
                fields.insert("year".to_string(), Value::String(raw));
                None
            }
        },
        None => None,
    };

    Ok(MasterRecord {
        year,
        main_release: take_text(&mut fields, "main_release"),
        artists: entity_refs(take_list(&mut fields, "artists", "artist")),
        genres: texts(take_list(&mut fields, "genres", "genre")),
        styles: texts(take_list(&mut fields, "styles", "style")),
        data_quality: take_text(&mut fields, "data_quality"),
        extra: into_extra(fields),
        id,
        title,
    })
}

fn convert_release(id: String, mut fields: Fields) -> Result<ReleaseRecord, String> {
    let title = required(&mut fields, "title", &id)?;

    let labels = take_list(&mut fields, "labels", "label")
        .iter()
        .filter_map(|label| {
            let name = attribute(label, "name")?;
            Some(LabelRef {
                id: attribute(label, "id"),
                name,
                catno: attribute(label, "catno"),
            })
        })
        .collect();

    let tracklist = take_list(&mut fields, "tracklist", "track")
        .into_iter()
        .filter_map(|track| {
            let Value::Object(mut track) = track else {
                return None;
            };
            Some(Track {
                title: take_text(&mut track, "title")?,
                position: take_text(&mut track, "position"),
                duration: take_text(&mut track, "duration"),
            })
        })
        .collect();

    Ok(ReleaseRecord {
        status: take_text(&mut fields, "@status"),
        country: take_text(&mut fields, "country"),
        released: take_text(&mut fields, "released"),
        master_id: take_text(&mut fields, "master_id"),
        artists: entity_refs(take_list(&mut fields, "artists", "artist")),
        labels,
        genres: texts(take_list(&mut fields, "genres", "genre")),
        styles: texts(take_list(&mut fields, "styles", "style")),
        tracklist,
        data_quality: take_text(&mut fields, "data_quality"),
        extra: into_extra(fields),
        id,
        title,
    })
}

/// Id from an `id` attribute or an `<id>` child.
fn take_id(fields: &mut Fields) -> Option<String> {
    take_text(fields, "@id").or_else(|| take_text(fields, "id"))
}

fn required(fields: &mut Fields, key: &str, id: &str) -> Result<String, String> {
    take_text(fields, key).ok_or_else(|| format!("record {id} has no {key}"))
}

/// Non-empty text of a leaf or of the `#text` of an element with attributes.
fn text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(text) => text.as_str(),
        Value::Object(object) => object.get("#text").and_then(Value::as_str)?,
        _ => return None,
    };
    let text = text.trim();

    (!text.is_empty()).then(|| text.to_string())
}

fn take_text(fields: &mut Fields, key: &str) -> Option<String> {
    fields.remove(key).as_ref().and_then(text)
}

fn attribute(value: &Value, name: &str) -> Option<String> {
    value
        .as_object()?
        .get(&format!("@{name}"))
        .and_then(text)
}

/// Items named `item` inside the `container` element.
fn take_list(fields: &mut Fields, container: &str, item: &str) -> Vec<Value> {
    match fields.remove(container) {
        Some(Value::Object(mut object)) => match object.remove(item) {
            Some(Value::Array(items)) => items,
            Some(single) => vec![single],
            None => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn texts(values: Vec<Value>) -> Vec<String> {
    values.iter().filter_map(text).collect()
}

/// Reference from `<name id="1">A</name>` or `<artist><id>1</id><name>A</name></artist>`.
fn entity_ref(value: &Value) -> Option<EntityRef> {
    match value {
        Value::String(_) => Some(EntityRef {
            id: None,
            name: text(value)?,
        }),
        Value::Object(object) => {
            let id = object
                .get("@id")
                .or_else(|| object.get("id"))
                .and_then(text);
            let name = object
                .get("#text")
                .or_else(|| object.get("name"))
                .and_then(text)?;
            Some(EntityRef { id, name })
        }
        _ => None,
    }
}

fn entity_refs(values: Vec<Value>) -> Vec<EntityRef> {
    values.iter().filter_map(entity_ref).collect()
}

fn into_extra(fields: Fields) -> BTreeMap<String, Value> {
    fields.into_iter().collect()
}
