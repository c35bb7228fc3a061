//! Demo chat application served by the `switchboard` binary.
//!
//! The default namespace echoes plain messages. The `/chat` namespace keeps
//! a nickname in the session and relays messages between rooms. Events
//! prefixed with `admin_` require the `admin` session flag.

use serde_json::{json, Value};
use switchboard_core::{arg, events, Dispatcher, EmitOptions, EventContext, HandlerResult, Socket};
use switchboard_protocol::Frame;
use switchboard_transport::ConnectionId;
use tracing::info;

/// Chat namespace.
pub const CHAT: &str = "/chat";

/// Build the dispatcher with every demo handler registered.
#[must_use]
pub fn dispatcher() -> Dispatcher {
    Dispatcher::builder()
        .on("", events::MESSAGE, echo_message)
        .on("", events::JSON, echo_json)
        .on("", "ping", ping)
        .on(CHAT, events::CONNECT, welcome)
        .on(CHAT, events::DISCONNECT, farewell)
        .on(CHAT, "nick", nick)
        .on(CHAT, "whoami", whoami)
        .on(CHAT, "join", join)
        .on(CHAT, "leave", leave)
        .on(CHAT, "say", say)
        .on(CHAT, "shout", shout)
        .on(CHAT, "rooms", rooms)
        .on(CHAT, "quit", quit)
        .on(CHAT, "admin_login", admin_login)
        .on(CHAT, "admin_kick", admin_kick)
        .guard(CHAT, admin_guard)
        .build()
}

fn admin_guard(socket: &Socket, event: &str) -> bool {
    if event == "admin_login" || !event.starts_with("admin_") {
        return true;
    }
    socket.session().get_as::<bool>("admin").unwrap_or(false)
}

async fn echo_message(cx: EventContext, args: Vec<Value>) -> HandlerResult {
    let text: String = arg(&args, 0)?;
    cx.send(text)?;
    Ok(Value::Null)
}

async fn echo_json(cx: EventContext, args: Vec<Value>) -> HandlerResult {
    let data: Value = arg(&args, 0)?;
    cx.send(data)?;
    Ok(Value::Null)
}

async fn ping(_cx: EventContext, args: Vec<Value>) -> HandlerResult {
    Ok(json!({ "pong": args }))
}

fn display_name(cx: &EventContext) -> String {
    let nick = cx.session().get_as::<String>("nick");
    nick.unwrap_or_else(|| cx.sid().to_string())
}

async fn welcome(cx: EventContext, _args: Vec<Value>) -> HandlerResult {
    cx.emit("welcome", vec![json!(cx.sid().as_str())])?;
    Ok(Value::Null)
}

async fn farewell(cx: EventContext, _args: Vec<Value>) -> HandlerResult {
    let name = display_name(&cx);
    for room in cx.rooms() {
        cx.emit_with("left", vec![json!(room), json!(name)], EmitOptions::room(room.clone()))?;
    }
    info!(connection = %cx.sid(), name = %name, "Chat user left");
    Ok(Value::Null)
}

async fn nick(cx: EventContext, args: Vec<Value>) -> HandlerResult {
    let nick: String = arg(&args, 0)?;
    if nick.trim().is_empty() {
        cx.error("invalid_nick", "Nickname must not be empty", None, true)?;
        return Ok(Value::Bool(false));
    }
    cx.session().insert("nick", nick)?;
    Ok(Value::Bool(true))
}

async fn whoami(cx: EventContext, _args: Vec<Value>) -> HandlerResult {
    Ok(json!({
        "sid": cx.sid().as_str(),
        "name": display_name(&cx),
        "rooms": cx.rooms().into_iter().collect::<Vec<_>>(),
    }))
}

async fn join(cx: EventContext, args: Vec<Value>) -> HandlerResult {
    let room: String = arg(&args, 0)?;
    let joined = cx.join_room(&room);
    if joined {
        let name = display_name(&cx);
        cx.emit_with("joined", vec![json!(room), json!(name)], EmitOptions::room(room.clone()))?;
    }
    Ok(Value::Bool(joined))
}

async fn leave(cx: EventContext, args: Vec<Value>) -> HandlerResult {
    let room: String = arg(&args, 0)?;
    let left = cx.leave_room(&room);
    if left {
        let name = display_name(&cx);
        cx.emit_with("left", vec![json!(room), json!(name)], EmitOptions::room(room.clone()))?;
    }
    Ok(Value::Bool(left))
}

async fn say(cx: EventContext, args: Vec<Value>) -> HandlerResult {
    let room: String = arg(&args, 0)?;
    let text: String = arg(&args, 1)?;
    if !cx.socket().in_room(&room) {
        cx.error("not_in_room", &format!("Join {:?} before talking in it", room), None, true)?;
        return Ok(Value::Null);
    }

    let report = cx.emit_with(
        "said",
        vec![json!(room), json!(display_name(&cx)), json!(text)],
        EmitOptions::room(room.clone()),
    )?;
    Ok(json!({ "delivered": report.delivered, "failed": report.failed.len() }))
}

async fn shout(cx: EventContext, args: Vec<Value>) -> HandlerResult {
    let text: String = arg(&args, 0)?;
    let report = cx.send_with(
        json!({ "from": display_name(&cx), "text": text }),
        EmitOptions::broadcast(),
    )?;
    Ok(json!(report.delivered))
}

async fn rooms(cx: EventContext, _args: Vec<Value>) -> HandlerResult {
    let mut names = cx.dispatcher().registry().room_names(cx.namespace());
    names.sort();
    Ok(json!(names))
}

async fn quit(cx: EventContext, args: Vec<Value>) -> HandlerResult {
    let silent: Option<bool> = arg(&args, 0)?;
    cx.disconnect(silent.unwrap_or(false))?;
    Ok(Value::Null)
}

async fn admin_login(cx: EventContext, args: Vec<Value>) -> HandlerResult {
    let password: String = arg(&args, 0)?;
    // Demo only: any non-empty password works.
    let granted = !password.is_empty();
    cx.session().insert("admin", granted)?;
    Ok(Value::Bool(granted))
}

async fn admin_kick(cx: EventContext, args: Vec<Value>) -> HandlerResult {
    let target: String = arg(&args, 0)?;
    let sid = ConnectionId::from(target);
    let Some(socket) = cx.dispatcher().registry().socket(&sid, cx.namespace()) else {
        return Ok(Value::Bool(false));
    };
    socket.send(&Frame::event(cx.namespace(), "kicked", vec![]))?;
    socket.close(false)?;
    Ok(Value::Bool(true))
}
