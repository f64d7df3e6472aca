//! In-page scripts injected over `Page.addScriptToEvaluateOnNewDocument` and
//! `Runtime.evaluate`.
//!
//! Each blob is idempotent: a global guard makes re-evaluation a no-op, so
//! self-healing re-injection never double-instruments a document.

/// Bootstrap recorder: event buffer, marker API and a drain hook.
///
/// Deployments that ship a full DOM recorder replace this source via
/// configuration; the drain loop only relies on the
/// `window.__browserlessRecording.events` contract.
pub(crate) const RECORDING_BOOTSTRAP: &str = r###"(() => {
  if (window.__browserlessRecording) return;
  const rec = {
    startedAt: Date.now(),
    events: [],
    stopped: false,
    push(tag, payload) {
      if (this.stopped) return;
      this.events.push({ tag, payload, ts: Date.now() });
    },
    stop() { this.stopped = true; }
  };
  window.__browserlessRecording = rec;
  rec.push('page.open', { url: location.href, title: document.title });
  try {
    const mo = new MutationObserver((muts) => {
      for (let i = 0; i < muts.length && i < 20; i++) {
        const m = muts[i];
        rec.push('dom.mutation', {
          kind: m.type,
          target: m.target && m.target.nodeName,
          added: m.addedNodes ? m.addedNodes.length : 0,
          removed: m.removedNodes ? m.removedNodes.length : 0
        });
      }
    });
    const arm = () => mo.observe(document.documentElement, {
      childList: true, subtree: true, attributes: true, characterData: true
    });
    if (document.documentElement) arm();
    else document.addEventListener('DOMContentLoaded', arm, { once: true });
  } catch (e) {}
  addEventListener('click', (e) => rec.push('input.click', {
    x: e.clientX, y: e.clientY, target: e.target && e.target.nodeName
  }), true);
  addEventListener('input', (e) => rec.push('input.value', {
    target: e.target && e.target.nodeName
  }), true);
})();"###;

/// Stripped-down recorder for cross-origin challenge iframes. No network or
/// console hooks: those would collide with the challenge vendor's own
/// instrumentation inside the frame.
pub(crate) const IFRAME_RECORDER: &str = r###"(() => {
  if (window.__browserlessRecording) return;
  window.__browserlessRecording = {
    startedAt: Date.now(),
    events: [],
    stopped: false,
    push(tag, payload) {
      if (this.stopped) return;
      this.events.push({ tag, payload, ts: Date.now() });
    },
    stop() { this.stopped = true; }
  };
})();"###;

/// Hooks the widget render cycle so a successful solve reaches the
/// coordinator even when no network observation is possible. Placeholders are
/// replaced per target before injection.
pub(crate) const CHALLENGE_HOOK_TEMPLATE: &str = r###"(() => {
  if (window.__turnstileHooked) return;
  window.__turnstileHooked = true;
  window.__turnstileSolved = false;
  const report = (token) => {
    window.__turnstileSolved = true;
    window.__turnstileToken = token || '';
    try {
      if (window.__turnstileSolvedBinding) window.__turnstileSolvedBinding(String(token || 'solved'));
    } catch (e) {}
  };
  const wrap = (ts) => {
    if (!ts || ts.__wrapped) return;
    ts.__wrapped = true;
    const render = ts.render && ts.render.bind(ts);
    if (!render) return;
    ts.render = (el, opts) => {
      opts = opts || {};
      const cb = opts.callback;
      opts.callback = (token) => {
        report(token);
        if (cb) try { cb(token); } catch (e) {}
      };
      return render(el, opts);
    };
  };
  if (window.turnstile) wrap(window.turnstile);
  else {
    let inner;
    Object.defineProperty(window, 'turnstile', {
      configurable: true,
      get() { return inner; },
      set(v) { inner = v; wrap(v); }
    });
  }
  addEventListener('pagehide', () => {
    const token = window.__turnstileToken || '';
    if (!window.__turnstileSolved) return;
    try {
      navigator.sendBeacon('__BEACON_URL__', JSON.stringify({
        s: '__SESSION_ID__', t: '__TARGET_ID__', l: token.length
      }));
    } catch (e) {}
  });
})();"###;

/// Single-shot challenge detection. The markers this reads are set inline by
/// the challenge host during HTML parse, so one evaluation is enough and a
/// poll loop would only delay the fallback path.
pub(crate) const DETECTION_SCRIPT: &str = r###"(() => {
  const out = { detected: false, m: '', url: location.href };
  const opt = window._cf_chl_opt;
  if (opt) {
    out.detected = true;
    out.m = 'cf_chl_opt';
    out.cType = opt.cType || '';
    out.cRay = opt.cRay || '';
  } else if (/just a moment|attention required/i.test(document.title || '')) {
    out.detected = true;
    out.m = 'title_interstitial';
  } else if (document.querySelector('#challenge-form, #challenge-stage, #challenge-error-title')) {
    out.detected = true;
    out.m = 'challenge_element';
  } else if (document.documentElement.classList.contains('challenge-running')) {
    out.detected = true;
    out.m = 'challenge_running_class';
  } else if (document.querySelector('#cf-error-details, .cf-error-details')) {
    out.detected = true;
    out.m = 'cf_error_page';
  } else if (document.body && /checking if the site connection is secure|verify you are human/i.test(document.body.innerText || '')) {
    out.detected = true;
    out.m = 'body_text_challenge';
  } else {
    const footer = document.querySelector('.ray-id, #cf-footer-item-ray');
    if (footer) {
      out.detected = true;
      out.m = 'ray_id_footer';
      out.cRay = (footer.textContent.match(/[0-9a-f]{16}/) || [''])[0];
    }
  }
  const frame = document.querySelector('iframe[src*="__CHALLENGE_HOST__"]');
  out.hasIframe = !!frame || !!document.querySelector('iframe[name^="cf-chl-widget"]');
  if (!out.detected && out.hasIframe) {
    out.detected = true;
    out.m = 'widget_iframe';
  }
  return JSON.stringify(out);
})()"###;

/// Cheap widget poll used when navigation detection found nothing. Covers
/// pages where response bodies were rewritten at the network layer and the
/// render hook never fired.
pub(crate) const WIDGET_POLL: &str = r###"(() => {
  const input = document.querySelector('input[name="cf-turnstile-response"], input[name="g-recaptcha-response"]');
  const widget = document.querySelector('.cf-turnstile, [data-sitekey], iframe[src*="__CHALLENGE_HOST__"], iframe[name^="cf-chl-widget"]');
  const token = (input && input.value) || window.__turnstileToken || '';
  return JSON.stringify({
    present: !!widget || !!input,
    solved: !!token || window.__turnstileSolved === true,
    tokenLength: token.length
  });
})()"###;

/// The four-signal solved predicate: the hook flag, the hidden response
/// input, the captured token and the explicit widget state mirror.
pub(crate) const SOLVED_PREDICATE: &str = r###"(() => {
  if (window.__turnstileSolved === true) return true;
  if ((window.__turnstileToken || '').length > 0) return true;
  if (window.__turnstileWidgetState === 'success') return true;
  const input = document.querySelector('input[name="cf-turnstile-response"]');
  return !!(input && input.value && input.value.length > 0);
})()"###;

/// Widget error probe. `confirmed_error` needs both an error surface and the
/// absence of a token; error text with a token present is cosmetic.
pub(crate) const WIDGET_ERROR_CHECK: &str = r###"(() => {
  const input = document.querySelector('input[name="cf-turnstile-response"]');
  const token = (input && input.value) || window.__turnstileToken || '';
  const el = document.querySelector('.cf-error-code, #challenge-error-text, [id^="cf-chl-widget"] .error');
  const text = el ? (el.textContent || '').trim().slice(0, 120) : '';
  const stateErr = window.__turnstileWidgetState === 'fail' || window.__turnstileWidgetState === 'expired';
  return JSON.stringify({ error: !!el || stateErr, text, hasToken: token.length > 0 });
})()"###;

/// Click-target finder. Returns `{x, y, m, d}` in viewport coordinates or
/// `{m:'none', d}`. Methods 0-5 are safe anywhere; 6-9 only run when the
/// page itself is a challenge document and wider scans cannot misfire.
pub(crate) const WIDGET_FINDER: &str = r###"(() => {
  const d = [];
  const vis = (el) => {
    if (!el) return null;
    try { el.scrollIntoView({ block: 'center', inline: 'center' }); } catch (e) {}
    const r = el.getBoundingClientRect();
    if (r.width < 10 || r.height < 10) return null;
    const style = getComputedStyle(el);
    if (style.visibility === 'hidden' || style.display === 'none') return null;
    return r;
  };
  const hit = (r, m) => ({ x: r.left + 30, y: r.top + r.height / 2, m, d: d.join('|') });
  const near = (v, want, tol) => Math.abs(v - want) <= tol;

  // 0: challenge-host iframes and named widget frames
  let el = document.querySelector('iframe[src*="__CHALLENGE_HOST__"]');
  let r = vis(el);
  if (r) return hit(r, '0_iframe_src');
  el = document.querySelector('iframe[name^="cf-chl-widget"]');
  r = vis(el);
  if (r) return hit(r, '0b_iframe_name');
  for (const host of document.querySelectorAll('#challenge-stage, .challenge-form, #challenge-form')) {
    el = host.querySelector('iframe, div[style*="border"]');
    r = vis(el);
    if (r) return hit(r, '0c_challenge_container');
  }
  d.push('no-iframe');

  // 1: ancestors of the hidden response input, strict then relaxed
  const input = document.querySelector('input[name="cf-turnstile-response"]');
  if (input) {
    let a = input.parentElement;
    for (let depth = 0; a && depth < 6; depth++, a = a.parentElement) {
      const ar = a.getBoundingClientRect();
      if (near(ar.width, 300, 10) && near(ar.height, 70, 15)) { r = vis(a); if (r) return hit(r, '1_input_ancestor'); }
    }
    a = input.parentElement;
    for (let depth = 0; a && depth < 6; depth++, a = a.parentElement) {
      const ar = a.getBoundingClientRect();
      if (ar.width >= 200 && ar.height >= 40) { r = vis(a); if (r) return hit(r, '1b_input_ancestor_relaxed'); }
    }
    d.push('input-no-ancestor');
  } else d.push('no-input');

  // 2: widget-shaped iframes, then widget wrappers forced to width
  for (const f of document.querySelectorAll('iframe')) {
    const fr = f.getBoundingClientRect();
    if (near(fr.width, 300, 10) && near(fr.height, 70, 15)) { r = vis(f); if (r) return hit(r, '2_iframe_shape'); }
  }
  el = document.querySelector('.cf-turnstile, .turnstile_widget');
  if (el) {
    el.style.width = '300px';
    r = vis(el);
    if (r) return hit(r, '2b_widget_class');
  }

  // shadow-host scoring shared by 3/4/5: prefer tight leaf boxes
  const score = (root, m) => {
    const leaves = [];
    for (const div of root.querySelectorAll('div')) {
      if (div.children.length) continue;
      const dr = div.getBoundingClientRect();
      if (dr.width < 20 || dr.height < 20) continue;
      const cs = getComputedStyle(div);
      leaves.push({ div, zero: cs.margin === '0px' && cs.padding === '0px', dr });
    }
    if (!leaves.length) return null;
    const rootW = root.getBoundingClientRect().width;
    leaves.sort((a, b) => {
      if (a.zero !== b.zero) return a.zero ? -1 : 1;
      return Math.abs(a.dr.width - rootW) - Math.abs(b.dr.width - rootW);
    });
    const best = leaves[0].div;
    const br = vis(best);
    return br ? hit(br, m) : null;
  };
  for (const c of document.querySelectorAll('.cf-turnstile[data-sitekey]')) {
    const h = score(c, '3_sitekey_leaf'); if (h) return h;
  }
  for (const c of document.querySelectorAll('[data-sitekey]')) {
    const h = score(c, '4_any_sitekey_leaf'); if (h) return h;
  }
  for (const c of document.querySelectorAll('form')) {
    const h = score(c, '5_form_leaf'); if (h) return h;
  }
  d.push('no-scored-leaf');

  // 6-9 gated: only on a genuine challenge page
  const gated = !!window._cf_chl_opt || document.documentElement.classList.contains('challenge-running')
    || !!document.querySelector('#challenge-form, #challenge-stage');
  if (!gated) return { m: 'none', d: d.join('|') };

  const h6 = score(document.body, '6_body_leaf'); if (h6) return h6;
  for (const div of document.querySelectorAll('div')) {
    if (div.shadowRoot) { r = vis(div); if (r) return hit(r, '7_shadow_host'); }
  }
  for (const div of document.querySelectorAll('div')) {
    const dr = div.getBoundingClientRect();
    const cs = getComputedStyle(div);
    const boxed = cs.borderStyle !== 'none' || cs.boxShadow !== 'none';
    if (boxed && dr.width >= 280 && dr.width <= 500 && dr.height >= 50 && dr.height <= 120) {
      r = vis(div); if (r) return hit(r, '8_bordered_box');
    }
  }
  for (const f of document.querySelectorAll('iframe')) {
    const fr = f.getBoundingClientRect();
    if (fr.width >= 100 && fr.height >= 40) { r = vis(f); if (r) return hit(r, '9_any_iframe'); }
  }
  return { m: 'none', d: d.join('|') };
})()"###;

/// Runs inside the challenge iframe; reports widget state transitions via a
/// binding and mirrors the observed state for in-page consumers.
pub(crate) const IFRAME_STATE_OBSERVER: &str = r###"(() => {
  if (window.__turnstileStateObserved) return;
  window.__turnstileStateObserved = true;
  let last = 'idle';
  const report = (state) => {
    if (state === last) return;
    last = state;
    try {
      if (window.__turnstileStateBinding) window.__turnstileStateBinding(state);
    } catch (e) {}
  };
  const classify = () => {
    const text = (document.body && document.body.innerText || '').toLowerCase();
    if (document.querySelector('#success, .success-circle') || /success/.test(text)) return 'success';
    if (document.querySelector('#fail, .failure-circle') || /failure|error/.test(text)) return 'fail';
    if (/expired/.test(text)) return 'expired';
    if (/timed? ?out/.test(text)) return 'timeout';
    if (document.querySelector('#verifying, .spinner') || /verifying|checking/.test(text)) return 'verifying';
    return last === 'idle' ? 'idle' : last;
  };
  const tick = () => report(classify());
  try {
    new MutationObserver(tick).observe(document.documentElement, {
      childList: true, subtree: true, attributes: true
    });
  } catch (e) {}
  setInterval(tick, 400);
})();"###;

/// Probe evaluated by the self-healing path after a run of empty drains.
pub(crate) const SELF_HEAL_PROBE: &str = r###"(() => JSON.stringify({
  hasBuffer: !!(window.__browserlessRecording && window.__browserlessRecording.events),
  hasStop: !!(window.__browserlessRecording && window.__browserlessRecording.stop),
  readyState: document.readyState,
  href: location.href
}))()"###;

/// Clears half-initialized recorder globals before a full re-injection.
pub(crate) const CLEAR_RESIDUAL: &str = r###"(() => {
  try { delete window.__browserlessRecording; } catch (e) { window.__browserlessRecording = undefined; }
})();"###;

/// Atomic read-and-clear of the recording buffer. Must run on the browser
/// socket: losing the response loses the drained events for good.
pub(crate) const DRAIN_BUFFER: &str = r###"(() => {
  const r = window.__browserlessRecording;
  if (!r || !r.events || !r.events.length) return '[]';
  const out = JSON.stringify(r.events);
  r.events.length = 0;
  return out;
})()"###;

/// Injects and focuses an invisible button so Tab order restarts from a
/// known position.
pub(crate) const FOCUS_RESET_BUTTON: &str = r###"(() => {
  let b = document.getElementById('__focus_reset');
  if (!b) {
    b = document.createElement('button');
    b.id = '__focus_reset';
    b.style.cssText = 'position:fixed;top:0;left:0;width:1px;height:1px;opacity:0;border:0;padding:0;';
    document.body.appendChild(b);
  }
  b.focus();
})();"###;

/// Builds the per-target challenge hook from the template.
pub(crate) fn challenge_hook(session_id: &str, target_id: &str, beacon_url: &str) -> String {
    CHALLENGE_HOOK_TEMPLATE
        .replace("__SESSION_ID__", session_id)
        .replace("__TARGET_ID__", target_id)
        .replace("__BEACON_URL__", beacon_url)
}

/// Substitutes the configured challenge host into a host-templated script.
pub(crate) fn with_challenge_host(script: &str, host: &str) -> String {
    script.replace("__CHALLENGE_HOST__", host)
}

/// Expression pushing a synthetic event into the page's recording buffer.
pub(crate) fn push_recording_event(tag: &str, payload: &serde_json::Value) -> String {
    format!(
        "window.__browserlessRecording && window.__browserlessRecording.push({}, {});",
        serde_json::Value::String(tag.to_string()),
        payload
    )
}

/// Expression appending an rrweb-style console plugin record to the buffer.
pub(crate) fn push_console_event(payload: &serde_json::Value) -> String {
    format!(
        "window.__browserlessRecording && window.__browserlessRecording.events.push({{plugin:'rrweb/console@1', payload:{}, ts: Date.now()}});",
        payload
    )
}

/// Expression bumping the challenge CDN activity heartbeat on the parent.
pub(crate) fn bump_cf_activity() -> String {
    "(() => { const a = window.__turnstileCFActivity = window.__turnstileCFActivity || {count:0,last:0}; a.count += 1; a.last = Date.now(); })();".to_string()
}

/// Expression bumping the `/pat/` exchange counters on the parent window.
pub(crate) fn bump_pat_counters(success: bool) -> String {
    format!(
        "(() => {{ const p = window.__turnstilePAT = window.__turnstilePAT || {{attempts:0,successes:0}}; p.attempts += 1; if ({success}) p.successes += 1; }})();"
    )
}

/// Expression mirroring the iframe widget state onto the parent window.
pub(crate) fn set_widget_state(state: &str) -> String {
    format!(
        "window.__turnstileWidgetState = {};",
        serde_json::Value::String(state.to_string())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_template_fills_all_placeholders() {
        let js = challenge_hook("sess1", "tgt7", "http://127.0.0.1:4110/management/cf-solved");
        assert!(!js.contains("__SESSION_ID__"));
        assert!(!js.contains("__TARGET_ID__"));
        assert!(!js.contains("__BEACON_URL__"));
        assert!(js.contains("tgt7"));
    }

    #[test]
    fn host_substitution() {
        let js = with_challenge_host(DETECTION_SCRIPT, "challenges.cloudflare.com");
        assert!(!js.contains("__CHALLENGE_HOST__"));
        assert!(js.contains("challenges.cloudflare.com"));
    }

    #[test]
    fn push_event_escapes_tag() {
        let expr = push_recording_event(
            "network.request",
            &serde_json::json!({"id": "iframe-1", "url": "https://x/"}),
        );
        assert!(expr.starts_with("window.__browserlessRecording"));
        assert!(expr.contains("\"network.request\""));
    }
}
