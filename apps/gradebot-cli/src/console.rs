//! Interactive console gateway.
//!
//! A line-oriented stand-in for the external messaging gateway: stdin
//! lines become inbound chat events, outbound messages print to stdout.
//! Button menus print as `/press <payload>` hints so callbacks can be
//! exercised from the keyboard, and `/file <path>` plays the role of a
//! file upload.

use anyhow::Result;
use gradebot_core::{BotHandle, Command, ConversationId, DocumentUpload, InboundEvent};
use tokio::io::{AsyncBufReadExt, BufReader};

/// The console represents a single conversation.
const CONSOLE_CONVERSATION: ConversationId = ConversationId(0);

/// Drive the bot from stdin until EOF or shutdown.
pub async fn run_gateway(mut handle: BotHandle) -> Result<()> {
    println!("gradebot console gateway - /start for a greeting, /file <path> to grade, Ctrl-D to quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match parse_line(line.trim()).await {
                    Ok(Some(event)) => handle.submit(CONSOLE_CONVERSATION, event).await?,
                    Ok(None) => {}
                    Err(reason) => println!("! {reason}"),
                }
            }
            reply = handle.next() => {
                let Some(message) = reply else {
                    break;
                };
                print_message(&message.body, message.menu.as_deref());
            }
        }
    }

    Ok(())
}

/// Turn one input line into an inbound event.
///
/// Returns `Ok(None)` for blank lines and `Err` with a local hint for
/// console-side problems (unknown command, unreadable file).
async fn parse_line(line: &str) -> Result<Option<InboundEvent>, String> {
    if line.is_empty() {
        return Ok(None);
    }

    if let Some(path) = line.strip_prefix("/file ") {
        let path = path.trim();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| format!("cannot read {path}: {e}"))?;
        let file_name = std::path::Path::new(path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_owned());
        return Ok(Some(InboundEvent::Document(DocumentUpload {
            declared_size: bytes.len() as u64,
            file_name,
            bytes,
        })));
    }

    if let Some(payload) = line.strip_prefix("/press ") {
        return Ok(Some(InboundEvent::Callback(payload.trim().to_owned())));
    }

    if let Some(command) = line.strip_prefix('/') {
        let command = match command {
            "start" => Command::Start,
            "help" => Command::Help,
            "newmodel" => Command::ChooseModel,
            "newparams" => Command::ChooseParams,
            "newprompt" => Command::EditPrompt,
            "cancel" => Command::Cancel,
            other => return Err(format!("unknown command /{other}")),
        };
        return Ok(Some(InboundEvent::Command(command)));
    }

    Ok(Some(InboundEvent::Text(line.to_owned())))
}

/// Print an outbound message, with menu buttons as press hints.
fn print_message(body: &str, menu: Option<&[gradebot_core::MenuButton]>) {
    println!("\n{body}");
    if let Some(buttons) = menu {
        for button in buttons {
            println!("  [{}] -> /press {}", button.label, button.payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_should_parse_commands() {
        let event = parse_line("/start").await.expect("should parse");
        assert!(matches!(
            event,
            Some(InboundEvent::Command(Command::Start))
        ));

        let event = parse_line("/newparams").await.expect("should parse");
        assert!(matches!(
            event,
            Some(InboundEvent::Command(Command::ChooseParams))
        ));
    }

    #[tokio::test]
    async fn test_should_parse_press_as_callback() {
        let event = parse_line("/press param:temperature")
            .await
            .expect("should parse");

        match event {
            Some(InboundEvent::Callback(payload)) => assert_eq!(payload, "param:temperature"),
            other => panic!("expected callback, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_should_parse_plain_line_as_text() {
        let event = parse_line("0.7").await.expect("should parse");
        match event {
            Some(InboundEvent::Text(text)) => assert_eq!(text, "0.7"),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_should_skip_blank_lines() {
        let event = parse_line("").await.expect("should parse");
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn test_should_reject_unknown_command_locally() {
        let result = parse_line("/frobnicate").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_should_read_file_as_document_upload() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let path = dir.path().join("lab1.txt");
        tokio::fs::write(&path, "print('hi')")
            .await
            .expect("should write file");

        let line = format!("/file {}", path.display());
        let event = parse_line(&line).await.expect("should parse");

        match event {
            Some(InboundEvent::Document(upload)) => {
                assert_eq!(upload.file_name, "lab1.txt");
                assert_eq!(upload.declared_size, 11);
                assert_eq!(upload.bytes, b"print('hi')");
            }
            other => panic!("expected document, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_should_report_unreadable_file_locally() {
        let result = parse_line("/file /nonexistent/lab1.txt").await;
        assert!(result.is_err());
    }
}
