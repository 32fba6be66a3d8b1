use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::OracleError;
use crate::ledger::models::Item;
use crate::matching::content::Content;

/// Image attached to an oracle request, labelled with its item
#[derive(Debug, Clone)]
pub struct Attachment {
    pub item_id: u64,
    pub content: Content,
}

/// Everything the oracle receives for one comparison
#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub prompt: String,
    pub attachments: Vec<Attachment>,
    pub schema: Value,
}

/// Schema-conforming oracle answer: `{match: null}` or `{match: {...}}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResponse {
    pub proposed: Option<ProposedMatch>,
}

impl MatchResponse {
    pub fn none() -> Self {
        Self { proposed: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedMatch {
    pub lost_id: u64,
    pub found_id: u64,
    #[serde(default)]
    pub confidence: Option<String>,
}

/// Response schema in the OpenAPI subset accepted by `generateContent`
pub fn response_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "match": {
                "type": "OBJECT",
                "nullable": true,
                "properties": {
                    "lostId": { "type": "INTEGER" },
                    "foundId": { "type": "INTEGER" },
                    "confidence": { "type": "STRING", "enum": ["high", "medium", "low"] }
                },
                "required": ["lostId", "foundId", "confidence"]
            }
        },
        "required": ["match"]
    })
}

fn describe(item: &Item, has_image: bool) -> Value {
    json!({
        "id": item.id,
        "title": item.title,
        "description": item.description,
        "image": if has_image { "attached" } else { "none" },
    })
}

/// Build the comparison request for the given lost and found items.
pub fn build_request(lost: &[&Item], found: &[&Item], attachments: Vec<Attachment>) -> OracleRequest {
    let has_image = |id: u64| attachments.iter().any(|a| a.item_id == id);

    let lost_json: Vec<Value> = lost.iter().map(|i| describe(i, has_image(i.id))).collect();
    let found_json: Vec<Value> = found.iter().map(|i| describe(i, has_image(i.id))).collect();

    let prompt = format!(
        "You reconcile a lost-and-found registry. Compare every LOST item with every \
         FOUND item using the titles, descriptions and any attached images (each image \
         is preceded by the id of the item it belongs to).\n\
         Return the single most likely pair as {{\"match\": {{\"lostId\", \"foundId\", \
         \"confidence\"}}}} where confidence is \"high\" only when the items are almost \
         certainly the same physical object, \"medium\" or \"low\" otherwise. Return \
         {{\"match\": null}} when nothing plausibly matches. Only use ids from the lists.\n\n\
         LOST:\n{}\n\nFOUND:\n{}\n",
        serde_json::to_string_pretty(&lost_json).unwrap_or_default(),
        serde_json::to_string_pretty(&found_json).unwrap_or_default(),
    );

    OracleRequest {
        prompt,
        attachments,
        schema: response_schema(),
    }
}

/// Parse the oracle's JSON text strictly against the response schema.
pub fn parse_match_response(text: &str) -> Result<MatchResponse, OracleError> {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| OracleError::Schema(format!("not JSON: {}", e)))?;

    let object = value
        .as_object()
        .ok_or_else(|| OracleError::Schema("top level is not an object".to_string()))?;

    let proposed = match object.get("match") {
        None => return Err(OracleError::Schema("missing `match` key".to_string())),
        Some(Value::Null) => None,
        Some(inner) => Some(
            serde_json::from_value::<ProposedMatch>(inner.clone())
                .map_err(|e| OracleError::Schema(format!("bad `match` object: {}", e)))?,
        ),
    };

    Ok(MatchResponse { proposed })
}
