//! Line commands of the interactive `edit` session.

use std::io;

use crate::models::is_editable_field;

pub const HELP: &str = "\
  title: <text>     set the title
  content: <text>   set the content
  date: <when>      set the note date (e.g. 2024-05-01T10:30)
  :flush            save pending edits now
  :delete           discard pending edits and delete the note
  :q                save pending edits and quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditCommand {
    Set { field: String, value: String },
    Flush,
    Delete,
    Quit,
    Help,
}

/// One read from the session's input stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Command(EditCommand),
    Invalid(String),
    Blank,
    /// End of input.
    Closed,
    /// The stream failed; the session ends as on end of input.
    Unreadable(String),
}

pub fn read_input(read: io::Result<Option<String>>) -> Input {
    match read {
        Ok(None) => Input::Closed,
        Err(e) => Input::Unreadable(e.to_string()),
        Ok(Some(line)) if line.trim().is_empty() => Input::Blank,
        Ok(Some(line)) => match parse_line(&line) {
            Ok(command) => Input::Command(command),
            Err(msg) => Input::Invalid(msg),
        },
    }
}

pub fn parse_line(line: &str) -> Result<EditCommand, String> {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.trim() {
        ":q" | ":quit" | ":wq" => return Ok(EditCommand::Quit),
        ":w" | ":flush" => return Ok(EditCommand::Flush),
        ":delete" => return Ok(EditCommand::Delete),
        ":h" | ":help" | "?" => return Ok(EditCommand::Help),
        _ => {}
    }

    let Some((field, value)) = line.split_once(':') else {
        return Err(format!("Expected `field: value`, got {:?}", line));
    };
    let field = match field.trim() {
        "date" => "note_date",
        other => other,
    };
    if !is_editable_field(field) {
        return Err(format!("Unknown field {:?}", field));
    }
    let value = value.strip_prefix(' ').unwrap_or(value);
    Ok(EditCommand::Set {
        field: field.to_string(),
        value: value.to_string(),
    })
}
