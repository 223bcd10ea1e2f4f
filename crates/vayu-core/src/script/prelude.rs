/// JS-side shim layered on top of the native bindings (`__pm_env_get`,
/// `__pm_record_test`, console capture, …). Keeping `pm.test`/`pm.expect`
/// here instead of building nested native objects in Rust is the easier
/// side of the embedding to get right, and it's re-evaluated on every
/// context reset so pooled contexts never leak prelude state.
pub const PRELUDE: &str = r#"
(function () {
  function makeStore(getFn, setFn, unsetFn) {
    return {
      get: function (key) { return getFn(key); },
      set: function (key, value) { setFn(key, String(value)); },
      unset: function (key) { unsetFn(key); },
    };
  }

  globalThis.pm = globalThis.pm || {};
  pm.environment = makeStore(__pm_env_get, __pm_env_set, __pm_env_unset);
  pm.globals = makeStore(__pm_globals_get, __pm_globals_set, __pm_globals_unset);
  pm.collectionVariables = makeStore(
    __pm_collection_get,
    __pm_collection_set,
    __pm_collection_unset
  );

  pm.test = function (name, fn) {
    try {
      fn();
      __pm_record_test(name, true, null);
    } catch (e) {
      __pm_record_test(name, false, e && e.message ? e.message : String(e));
    }
  };

  function AssertionError(message) {
    this.message = message;
  }

  pm.expect = function (actual) {
    return {
      to: {
        equal: function (expected) {
          if (actual !== expected) {
            throw new AssertionError(
              "expected " + JSON.stringify(actual) + " to equal " + JSON.stringify(expected)
            );
          }
        },
        exist: function () {
          if (actual === null || actual === undefined) {
            throw new AssertionError("expected value to exist");
          }
        },
        contain: function (needle) {
          var hasIndexOf = actual && typeof actual.indexOf === "function";
          if (!hasIndexOf || actual.indexOf(needle) === -1) {
            throw new AssertionError(
              "expected " + JSON.stringify(actual) + " to contain " + JSON.stringify(needle)
            );
          }
        },
      },
    };
  };

  globalThis.console = {
    log: function () { __pm_console("log", Array.prototype.slice.call(arguments).join(" ")); },
    warn: function () { __pm_console("warn", Array.prototype.slice.call(arguments).join(" ")); },
    error: function () { __pm_console("error", Array.prototype.slice.call(arguments).join(" ")); },
  };
})();
"#;
