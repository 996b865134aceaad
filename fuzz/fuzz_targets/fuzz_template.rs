#![no_main]

use libfuzzer_sys::fuzz_target;
use serde_json::json;

use wacrm::flows::context::{Context, Scope};
use wacrm::flows::template::{render_text, resolve_value};

fuzz_target!(|data: &str| {
    // Malformed expressions degrade to empty values; none may panic.
    let mut vars = Context::new();
    vars.insert("name".into(), json!("Tariro"));
    vars.insert("items".into(), json!([{"sku": "A", "name": "Alpha", "price": 1}]));
    vars.insert("nested".into(), json!({"list": [1, 2, 3], "flag": true}));
    let scope = Scope::new(&vars);

    let _ = render_text(data, &scope);
    let _ = resolve_value(&json!(data), &scope);

    let wrapped = format!("{{{{ {data} }}}}");
    let _ = render_text(&wrapped, &scope);
});
