//! Embedded viewer page served at `/`.

pub(crate) const HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Rover</title>
<style>
  body { font-family: sans-serif; margin: 1rem; background: #111; color: #eee; }
  #video { width: 100%; max-width: 640px; background: #000; display: block; }
  .pad { display: grid; grid-template-columns: repeat(3, 4rem); gap: .4rem; margin: 1rem 0; }
  button { height: 3rem; font-size: 1rem; }
  #log { font-family: monospace; font-size: .8rem; white-space: pre; max-height: 10rem; overflow: auto; }
</style>
</head>
<body>
<h1>Rover</h1>
<img id="video" alt="video">
<div class="pad">
  <span></span><button data-cmd="forward">&#8593;</button><span></span>
  <button data-cmd="left">&#8592;</button><button data-cmd="stop">&#9632;</button><button data-cmd="right">&#8594;</button>
  <span></span><button data-cmd="backward">&#8595;</button><span></span>
</div>
<label>Speed <input id="speed" type="range" min="0" max="100" value="80"></label>
<p>
  <button id="start">Start stream</button>
  <button id="stopStream">Stop stream</button>
  <button id="capture">Capture</button>
</p>
<div id="log"></div>
<script>
  const log = (line) => {
    const el = document.getElementById("log");
    el.textContent = (line + "\n" + el.textContent).slice(0, 4000);
  };
  const ws = new WebSocket(`ws://${location.host}/ws?session=viewer`);
  const send = (msg) => ws.readyState === 1 && ws.send(JSON.stringify(msg));
  ws.onmessage = (event) => {
    const msg = JSON.parse(event.data);
    if (msg.type === "frame") {
      document.getElementById("video").src = "data:image/jpeg;base64," + msg.data;
    } else if (msg.command === "capture" && msg.status === "ok") {
      document.getElementById("video").src = "data:image/jpeg;base64," + msg.data;
      log("captured " + msg.width + "x" + msg.height);
    } else {
      log(event.data);
    }
  };
  ws.onclose = () => log("disconnected");
  document.querySelectorAll("[data-cmd]").forEach((b) =>
    b.addEventListener("click", () => send({ command: b.dataset.cmd })));
  document.getElementById("speed").addEventListener("change", (e) =>
    send({ command: "speed", value: Number(e.target.value) }));
  document.getElementById("start").onclick = () => send({ command: "stream", action: "start" });
  document.getElementById("stopStream").onclick = () => send({ command: "stream", action: "stop" });
  document.getElementById("capture").onclick = () => send({ command: "capture" });
</script>
</body>
</html>
"#;
