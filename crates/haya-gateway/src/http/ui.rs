//! Embedded web-chat page.
//!
//! A single self-contained page: prompts for the gateway token, opens the
//! WebSocket with it as a query parameter, keeps a 16-byte hex session id
//! in localStorage, and speaks the chat.send/chat.stream protocol. Inline
//! script and style are allowed only through the per-response CSP nonce.

use axum::{
    http::{header::HeaderName, HeaderValue},
    response::{Html, IntoResponse, Response},
};

use super::headers::{csp_value, make_nonce, CSP_HEADER};

pub async fn chat_ui_handler() -> Response {
    let nonce = make_nonce();
    let html = CHAT_PAGE.replace("{NONCE}", &nonce);

    let mut resp = Html(html).into_response();
    if let Ok(value) = HeaderValue::from_str(&csp_value(&nonce)) {
        resp.headers_mut()
            .insert(HeaderName::from_static(CSP_HEADER), value);
    }
    resp
}

const CHAT_PAGE: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Haya</title>
<style nonce="{NONCE}">
  body { font-family: system-ui, sans-serif; margin: 0; background: #111; color: #eee;
         display: flex; flex-direction: column; height: 100vh; }
  #log { flex: 1; overflow-y: auto; padding: 1rem; }
  .msg { margin: 0.4rem 0; white-space: pre-wrap; }
  .user { color: #8cf; }
  .assistant { color: #eee; }
  .error { color: #f88; }
  #bar { display: flex; padding: 0.6rem; gap: 0.5rem; border-top: 1px solid #333; }
  #input { flex: 1; padding: 0.5rem; background: #222; color: #eee;
           border: 1px solid #444; border-radius: 4px; }
  button { padding: 0.5rem 1rem; background: #2a6; color: #fff;
           border: none; border-radius: 4px; cursor: pointer; }
</style>
</head>
<body>
<div id="log"></div>
<div id="bar">
  <input id="input" placeholder="Message Haya…" autocomplete="off">
  <button id="send">Send</button>
</div>
<script nonce="{NONCE}">
  const log = document.getElementById('log');
  const input = document.getElementById('input');

  function line(cls, text) {
    const el = document.createElement('div');
    el.className = 'msg ' + cls;
    el.textContent = text;
    log.appendChild(el);
    log.scrollTop = log.scrollHeight;
    return el;
  }

  function sessionId() {
    let id = localStorage.getItem('haya.session');
    if (!id) {
      const bytes = new Uint8Array(16);
      crypto.getRandomValues(bytes);
      id = Array.from(bytes, b => b.toString(16).padStart(2, '0')).join('');
      localStorage.setItem('haya.session', id);
    }
    return id;
  }

  function token() {
    let t = localStorage.getItem('haya.token');
    if (!t) {
      t = prompt('Gateway token');
      if (t) localStorage.setItem('haya.token', t);
    }
    return t || '';
  }

  const proto = location.protocol === 'https:' ? 'wss' : 'ws';
  const ws = new WebSocket(proto + '://' + location.host + '/?token=' + encodeURIComponent(token()));
  let seq = 0;
  let current = null;

  ws.onclose = (ev) => {
    if (ev.code === 1008) {
      localStorage.removeItem('haya.token');
      line('error', 'Error: unauthorized');
    } else {
      line('error', 'Connection closed');
    }
  };

  ws.onmessage = (ev) => {
    const frame = JSON.parse(ev.data);
    if (frame.event === 'chat.delta') {
      if (!current) current = line('assistant', '');
      current.textContent += frame.data.content;
    } else if (frame.event === 'chat.response') {
      if (!current) line('assistant', frame.data.text);
      current = null;
    } else if (frame.error) {
      current = null;
      line('error', 'Error: ' + frame.error.message);
    }
  };

  function send() {
    const text = input.value.trim();
    if (!text || ws.readyState !== WebSocket.OPEN) return;
    input.value = '';
    line('user', text);
    ws.send(JSON.stringify({
      id: 'ui-' + (++seq),
      method: 'chat.stream',
      params: { sessionId: 'webchat-' + sessionId(), message: text },
    }));
  }

  document.getElementById('send').addEventListener('click', send);
  input.addEventListener('keydown', (ev) => { if (ev.key === 'Enter') send(); });
</script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_has_no_unnonced_inline_blocks() {
        assert!(CHAT_PAGE.contains(r#"<script nonce="{NONCE}">"#));
        assert!(CHAT_PAGE.contains(r#"<style nonce="{NONCE}">"#));
        assert!(!CHAT_PAGE.contains("<script>"));
        assert!(!CHAT_PAGE.contains("<style>"));
    }
}
