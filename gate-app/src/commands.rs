//! Chat command and callback-data parsing for the gatekeep bot.

use gate_core::RequestId;
use gate_platform::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    /// 1-based index into the configured spaces.
    Join(usize),
    Pending,
    Approve(RequestId),
    Reject(RequestId),
    Rotate,
    /// `None` reports the current value.
    AutoAdmit(Option<bool>),
    Unblock(UserId),
    Status,
}

impl Command {
    pub fn requires_operator(self) -> bool {
        !matches!(self, Self::Start | Self::Help | Self::Join(_))
    }
}

pub const USER_HELP: &str = "/start - list spaces you can join\n/join <number> - ask to join a space";

pub const OPERATOR_HELP: &str = "/pending - requests waiting for review\n\
/approve <id> - approve a request\n\
/reject <id> - reject a request\n\
/rotate - switch to the next delegate account\n\
/autoadmit [on|off] - show or change automatic admission\n\
/unblock <user_id> - lift a rate-limit block\n\
/status - delegate pool summary";

/// Returns `None` for plain text, `Some(Err(usage))` for a malformed command.
pub fn parse_command(input: &str) -> Option<Result<Command, String>> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let mut parts = trimmed.split_whitespace();
    let head = parts.next()?;
    // Group chats address commands as `/cmd@botname`.
    let name = head
        .split('@')
        .next()
        .unwrap_or(head)
        .to_ascii_lowercase();
    let args: Vec<&str> = parts.collect();

    let parsed = match name.as_str() {
        "/start" | "/menu" => Ok(Command::Start),
        "/help" => Ok(Command::Help),
        "/join" => single_arg(&args, "Usage: /join <number>")
            .and_then(|arg| parse_space_index(arg).ok_or_else(|| "Usage: /join <number>".to_string()))
            .map(Command::Join),
        "/pending" => Ok(Command::Pending),
        "/approve" => parse_request_id(&args, "Usage: /approve <request id>").map(Command::Approve),
        "/reject" => parse_request_id(&args, "Usage: /reject <request id>").map(Command::Reject),
        "/rotate" => Ok(Command::Rotate),
        "/autoadmit" => match args.as_slice() {
            [] => Ok(Command::AutoAdmit(None)),
            [value] => parse_toggle(value)
                .map(|enabled| Command::AutoAdmit(Some(enabled)))
                .ok_or_else(|| "Usage: /autoadmit [on|off]".to_string()),
            _ => Err("Usage: /autoadmit [on|off]".to_string()),
        },
        "/unblock" => single_arg(&args, "Usage: /unblock <user id>")
            .and_then(|arg| {
                arg.parse::<i64>()
                    .map(UserId::new)
                    .map_err(|_| "Usage: /unblock <user id>".to_string())
            })
            .map(Command::Unblock),
        "/status" => Ok(Command::Status),
        _ => Err(format!("Unknown command.\n{USER_HELP}")),
    };
    Some(parsed)
}

fn single_arg<'a>(args: &[&'a str], usage: &str) -> Result<&'a str, String> {
    match args {
        [arg] => Ok(arg),
        _ => Err(usage.to_string()),
    }
}

fn parse_request_id(args: &[&str], usage: &str) -> Result<RequestId, String> {
    let arg = single_arg(args, usage)?;
    arg.trim_start_matches('#')
        .parse::<i64>()
        .map(RequestId::new)
        .map_err(|_| usage.to_string())
}

fn parse_space_index(arg: &str) -> Option<usize> {
    arg.parse::<usize>().ok().filter(|n| *n >= 1)
}

fn parse_toggle(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Some(true),
        "off" | "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// Inline-button payloads. Telegram caps callback data at 64 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Join(usize),
    Approve(RequestId),
    Reject(RequestId),
    Menu,
}

impl CallbackAction {
    pub fn encode(self) -> String {
        match self {
            Self::Join(index) => format!("join:{index}"),
            Self::Approve(id) => format!("approve:{id}"),
            Self::Reject(id) => format!("reject:{id}"),
            Self::Menu => "menu".to_string(),
        }
    }

    pub fn parse(data: &str) -> Option<Self> {
        let data = data.trim();
        if data == "menu" {
            return Some(Self::Menu);
        }
        let (kind, value) = data.split_once(':')?;
        match kind {
            "join" => parse_space_index(value).map(Self::Join),
            "approve" => value.parse::<i64>().ok().map(|id| Self::Approve(RequestId::new(id))),
            "reject" => value.parse::<i64>().ok().map(|id| Self::Reject(RequestId::new(id))),
            _ => None,
        }
    }

    pub fn requires_operator(self) -> bool {
        matches!(self, Self::Approve(_) | Self::Reject(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(parse_command("hello there"), None);
        assert_eq!(parse_command("   "), None);
    }

    #[test]
    fn parses_user_commands() {
        assert_eq!(parse_command("/start"), Some(Ok(Command::Start)));
        assert_eq!(parse_command("/start@gatekeep_bot"), Some(Ok(Command::Start)));
        assert_eq!(parse_command("/join 2"), Some(Ok(Command::Join(2))));
        assert!(matches!(parse_command("/join 0"), Some(Err(_))));
        assert!(matches!(parse_command("/join"), Some(Err(_))));
    }

    #[test]
    fn parses_operator_commands() {
        assert_eq!(
            parse_command("/approve #17"),
            Some(Ok(Command::Approve(RequestId::new(17))))
        );
        assert_eq!(
            parse_command("/reject 17"),
            Some(Ok(Command::Reject(RequestId::new(17))))
        );
        assert_eq!(
            parse_command("/autoadmit OFF"),
            Some(Ok(Command::AutoAdmit(Some(false))))
        );
        assert_eq!(parse_command("/autoadmit"), Some(Ok(Command::AutoAdmit(None))));
        assert!(matches!(parse_command("/autoadmit maybe"), Some(Err(_))));
        assert_eq!(
            parse_command("/unblock 123456"),
            Some(Ok(Command::Unblock(UserId::new(123456))))
        );
        assert!(Command::Rotate.requires_operator());
        assert!(!Command::Join(1).requires_operator());
    }

    #[test]
    fn unknown_command_lists_help() {
        let Some(Err(message)) = parse_command("/dance") else {
            panic!("expected usage error");
        };
        assert!(message.contains("/join"));
    }

    #[test]
    fn callback_payloads_parse_back() {
        for action in [
            CallbackAction::Join(1),
            CallbackAction::Approve(RequestId::new(9)),
            CallbackAction::Reject(RequestId::new(9)),
            CallbackAction::Menu,
        ] {
            assert_eq!(CallbackAction::parse(&action.encode()), Some(action));
        }
        assert_eq!(CallbackAction::parse("approve:x"), None);
        assert_eq!(CallbackAction::parse("join:0"), None);
        assert!(CallbackAction::Approve(RequestId::new(1)).requires_operator());
    }
}
