//! The stateful XML codec.
//!
//! A [`Transformer`] belongs to one side of one connection. Besides mapping
//! commands to frames and back, it remembers every request it has encoded
//! until a final response to it is decoded, which is how incoming responses
//! are correlated to their requests.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;

use crate::command::{
    ClientId, Command, Notification, Parameters, Request, RequestId, Response, Status,
};
use crate::error::ProtocolError;
use crate::schema::SchemaTable;
use crate::xml::{self, Element, XmlWriter};
use crate::{END_OF_COMMAND, ROOT_TAG};

const SENDER_TAG: &str = "sender";
const REQUEST_TAG: &str = "request";
const RESPONSE_TAG: &str = "response";
const NOTIFICATION_TAG: &str = "notification";

/// Bidirectional Command <-> frame codec with response correlation.
#[derive(Debug)]
pub struct Transformer {
    schemas: Arc<SchemaTable>,
    waiting: HashMap<RequestId, Request>,
}

impl Transformer {
    pub fn new(schemas: Arc<SchemaTable>) -> Self {
        Self {
            schemas,
            waiting: HashMap::new(),
        }
    }

    /// Decodes one frame. A trailing terminator byte is accepted and ignored.
    ///
    /// Responses whose `answers` id does not match a request this transformer
    /// encoded (or one that was already answered) are dropped with a warning.
    pub fn decode(&mut self, frame: &[u8]) -> Result<Command, ProtocolError> {
        let body = match frame.split_last() {
            Some((&END_OF_COMMAND, body)) => body,
            _ => frame,
        };
        let text = std::str::from_utf8(body)
            .map_err(|_| ProtocolError::malformed("frame is not valid UTF-8"))?;
        let root = xml::parse(text)?;
        if root.name != ROOT_TAG {
            return Err(ProtocolError::malformed(format!(
                "unexpected root element `{}`, expected `{ROOT_TAG}`",
                root.name
            )));
        }

        let mut command = Command::new();
        let mut response_elements = 0;
        let mut notification_elements = 0;
        for child in &root.children {
            match child.name.as_str() {
                SENDER_TAG => command.sender = Some(decode_sender(child)?),
                REQUEST_TAG => command.requests.push(self.decode_request(child)?),
                RESPONSE_TAG => {
                    response_elements += 1;
                    if let Some(response) = self.decode_response(child)? {
                        command.responses.push(response);
                    }
                }
                NOTIFICATION_TAG => {
                    notification_elements += 1;
                    command.notifications.push(decode_notification(child)?);
                }
                other => {
                    return Err(ProtocolError::malformed(format!(
                        "unexpected element `{other}`"
                    )))
                }
            }
        }

        if command.requests.iter().any(Request::is_hello)
            && (command.requests.len() != 1
                || command.sender.is_some()
                || response_elements > 0
                || notification_elements > 0)
        {
            return Err(ProtocolError::InvalidHello);
        }

        Ok(command)
    }

    /// Encodes `command` into a terminated frame.
    ///
    /// Every encoded request is remembered as waiting for a response.
    pub fn encode(&mut self, command: &Command) -> Result<Vec<u8>, ProtocolError> {
        if command.is_empty() {
            return Err(ProtocolError::EmptyCommand);
        }

        let mut writer = XmlWriter::new();
        writer.open(ROOT_TAG, &[])?;

        if let Some(sender) = command.sender {
            writer.open(SENDER_TAG, &[])?;
            writer.leaf("id", &sender.to_string())?;
            writer.close(SENDER_TAG)?;
        }

        for request in &command.requests {
            let id = request.id.to_string();
            writer.open(REQUEST_TAG, &[("type", &request.kind), ("id", &id)])?;
            write_parameters(&mut writer, &request.parameters)?;
            writer.close(REQUEST_TAG)?;
        }

        for response in &command.responses {
            let id = response.id.to_string();
            let answers = response.answers.to_string();
            writer.open(
                RESPONSE_TAG,
                &[
                    ("type", &response.kind),
                    ("id", &id),
                    ("answers", &answers),
                    ("status", response.status.as_str()),
                ],
            )?;
            write_parameters(&mut writer, &response.parameters)?;
            writer.close(RESPONSE_TAG)?;
        }

        for notification in &command.notifications {
            writer.open(NOTIFICATION_TAG, &[("type", &notification.kind)])?;
            write_parameters(&mut writer, &notification.parameters)?;
            writer.close(NOTIFICATION_TAG)?;
        }

        writer.close(ROOT_TAG)?;
        let mut frame = writer.finish();
        frame.push(END_OF_COMMAND);

        // Only register once the whole frame encoded successfully.
        for request in &command.requests {
            self.waiting.insert(request.id, request.clone());
        }

        Ok(frame)
    }

    /// Whether a request with this id was sent and is still unanswered.
    pub fn is_waiting(&self, id: RequestId) -> bool {
        self.waiting.contains_key(&id)
    }

    /// The outstanding request `id`, with the interim responses seen so far.
    pub fn waiting(&self, id: RequestId) -> Option<&Request> {
        self.waiting.get(&id)
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    /// Stops waiting for an answer to `id`, returning the request if it was
    /// still outstanding.
    pub fn forget(&mut self, id: RequestId) -> Option<Request> {
        self.waiting.remove(&id)
    }

    pub fn schemas(&self) -> &SchemaTable {
        &self.schemas
    }

    fn decode_request(&self, element: &Element) -> Result<Request, ProtocolError> {
        let kind = required_attribute(element, "type")?;
        let id = parse_id(element, "id")?;
        let mut request = Request::new(id, kind);
        request.parameters = decode_parameters(element)?;
        self.schemas.apply_defaults(&mut request);
        Ok(request)
    }

    fn decode_response(&mut self, element: &Element) -> Result<Option<Response>, ProtocolError> {
        let id = parse_id(element, "id")?;
        let answers = parse_id(element, "answers")?;
        let status = Status::from(required_attribute(element, "status")?);
        let parameters = decode_parameters(element)?;

        let Some(request) = self.waiting.get_mut(&answers) else {
            warn!(
                "Dropping response {} to unknown or already answered request {}",
                id, answers
            );
            return Ok(None);
        };

        if let Some(kind) = element.attribute("type") {
            if kind != request.kind {
                warn!(
                    "Response {} claims type {} but request {} is a {}",
                    id, kind, answers, request.kind
                );
            }
        }

        let mut response = Response::to(request, id, status);
        response.parameters = parameters;
        request.responses.push(response.clone());
        if request.is_answered() {
            self.waiting.remove(&answers);
        }
        Ok(Some(response))
    }
}

impl Default for Transformer {
    fn default() -> Self {
        Self::new(Arc::new(SchemaTable::core()))
    }
}

fn decode_sender(element: &Element) -> Result<ClientId, ProtocolError> {
    let id = element
        .children
        .iter()
        .find(|child| child.name == "id")
        .ok_or_else(|| ProtocolError::malformed("sender block without an id"))?;
    id.text
        .trim()
        .parse()
        .map_err(|_| ProtocolError::malformed(format!("invalid sender id `{}`", id.text)))
}

fn decode_notification(element: &Element) -> Result<Notification, ProtocolError> {
    Ok(Notification {
        kind: required_attribute(element, "type")?.to_string(),
        parameters: decode_parameters(element)?,
    })
}

fn decode_parameters(element: &Element) -> Result<Parameters, ProtocolError> {
    let mut parameters = Parameters::new();
    for child in &element.children {
        if !child.children.is_empty() {
            return Err(ProtocolError::malformed(format!(
                "parameter `{}` of `{}` must not contain elements",
                child.name, element.name
            )));
        }
        parameters.insert(child.name.clone(), child.text.clone());
    }
    Ok(parameters)
}

fn write_parameters(writer: &mut XmlWriter, parameters: &Parameters) -> Result<(), ProtocolError> {
    for (name, value) in parameters {
        writer.leaf(name, value)?;
    }
    Ok(())
}

fn required_attribute<'a>(element: &'a Element, key: &str) -> Result<&'a str, ProtocolError> {
    element.attribute(key).ok_or_else(|| {
        ProtocolError::malformed(format!("`{}` element without `{key}` attribute", element.name))
    })
}

fn parse_id(element: &Element, key: &str) -> Result<RequestId, ProtocolError> {
    let value = required_attribute(element, key)?;
    value.trim().parse().map_err(|_| {
        ProtocolError::malformed(format!(
            "`{}` attribute `{key}` is not an id: `{value}`",
            element.name
        ))
    })
}
