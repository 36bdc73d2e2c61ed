//! Single-page browser UI served at `/`.

pub const INDEX_HTML: &str = r##"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Tomato Detection</title>
<style>
  body { font-family: sans-serif; margin: 0; display: flex; min-height: 100vh; }
  aside { width: 300px; padding: 16px; background: #f3f3f3; box-sizing: border-box; }
  main { flex: 1; padding: 16px; }
  fieldset { border: 1px solid #ccc; margin-bottom: 12px; }
  label { display: block; margin: 4px 0; }
  input[type=text] { width: 100%; box-sizing: border-box; }
  button { margin-top: 8px; }
  #frame { width: 720px; height: 405px; background: #222; object-fit: contain; }
  #notices div { margin: 4px 0; padding: 6px; border-radius: 4px; }
  .info { background: #e7f0fb; }
  .success { background: #e3f6e6; }
  .error { background: #fbe7e7; }
</style>
</head>
<body>
<aside>
  <h2>Model Config</h2>
  <label>Select Model Confidence
    <input id="conf" type="range" min="25" max="100" value="40">
    <span id="conf-value">40</span>
  </label>

  <h2>Source Config</h2>
  <fieldset>
    <label><input type="radio" name="source" value="image"> Image</label>
    <label><input type="radio" name="source" value="video" checked> Video</label>
    <label><input type="radio" name="source" value="stored"> Stored video</label>
    <label><input type="radio" name="source" value="webcam"> Webcam</label>
    <label><input type="radio" name="source" value="rtsp"> RTSP</label>
    <label><input type="radio" name="source" value="youtube"> YouTube</label>
  </fieldset>

  <fieldset id="url-box">
    <label id="url-label" for="url">YouTube Video url</label>
    <input id="url" type="text">
  </fieldset>
  <fieldset id="file-box">
    <label for="file">Choose a file</label>
    <input id="file" type="file" accept=".mp4,.avi,.mov,.mkv,image/*">
  </fieldset>
  <fieldset id="stored-box">
    <label for="stored">Choose a video</label>
    <input id="stored" type="text" placeholder="video name">
  </fieldset>

  <fieldset>
    <legend>Display Tracker</legend>
    <label><input type="radio" name="display-tracker" value="no" checked> No</label>
    <label><input type="radio" name="display-tracker" value="yes"> Yes</label>
    <div id="tracker-box" hidden>
      <label><input type="radio" name="tracker" value="bytetrack.yaml" checked> bytetrack.yaml</label>
      <label><input type="radio" name="tracker" value="botsort.yaml"> botsort.yaml</label>
    </div>
  </fieldset>

  <button id="detect">Detect Tomatoes</button>
  <button id="stop">Stop</button>
</aside>
<main>
  <h1>Tomato Detection</h1>
  <img id="frame" alt="">
  <div id="caption"></div>
  <div id="notices"></div>
</main>
<script>
const $ = (id) => document.getElementById(id);
const checked = (name) => document.querySelector(`input[name="${name}"]:checked`).value;
let lastSeq = 0;

function refreshInputs() {
  const source = checked("source");
  $("url-box").hidden = !(source === "rtsp" || source === "youtube");
  $("url-label").textContent = source === "rtsp" ? "rtsp stream url:" : "YouTube Video url";
  $("file-box").hidden = !(source === "video" || source === "image");
  $("stored-box").hidden = source !== "stored";
  $("tracker-box").hidden = checked("display-tracker") !== "yes";
}
document.querySelectorAll("input[type=radio]").forEach((el) => el.addEventListener("change", refreshInputs));
$("conf").addEventListener("input", () => { $("conf-value").textContent = $("conf").value; });

$("detect").addEventListener("click", async () => {
  const source = checked("source");
  const params = new URLSearchParams({ source, conf: $("conf").value });
  if (checked("display-tracker") === "yes") params.set("tracker", checked("tracker"));
  if (source === "rtsp" || source === "youtube") params.set("url", $("url").value);
  if (source === "stored") params.set("name", $("stored").value);
  let body = null;
  const file = $("file").files[0];
  if ((source === "video" || source === "image") && file) {
    params.set("name", file.name);
    body = file;
  }
  if (source === "video" && !file) {
    render([{ level: "info", message: "Please upload a video file to get started." }]);
    return;
  }
  const res = await fetch(`/detect?${params}`, { method: "POST", body });
  if (!res.ok) {
    const detail = await res.json().catch(() => ({}));
    render([{ level: "error", message: detail.detail || detail.error || res.statusText }]);
  }
});
$("stop").addEventListener("click", () => fetch("/stop", { method: "POST" }));

function render(notices) {
  $("notices").replaceChildren(...notices.map((n) => {
    const div = document.createElement("div");
    div.className = n.level;
    div.textContent = n.message;
    return div;
  }));
}

async function poll() {
  try {
    const status = await (await fetch("/status")).json();
    if (status.seq !== lastSeq) {
      lastSeq = status.seq;
      $("frame").src = `/frame.jpg?seq=${status.seq}`;
      $("caption").textContent = status.caption;
    }
    render(status.notices);
  } catch (_) {}
  setTimeout(poll, 100);
}

refreshInputs();
poll();
</script>
</body>
</html>
"##;
