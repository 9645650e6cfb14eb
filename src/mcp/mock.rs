//! Mock 模式响应（用于测试与演示，无需任何远程服务）
//!
//! 按服务与工具名合成与真实响应形状一致的确定性负载，统一打上 `mock_mode: true` 与服务标签。

use serde_json::{json, Map, Value};

use crate::mcp::transport::ToolResult;

/// 从参数里取字符串字段，缺省时用给定值
fn arg<'a>(args: &'a Value, key: &str, default: &'a str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or(default)
}

fn mock_bill(args: &Value) -> Value {
    json!({
        "id": arg(args, "bill_id", "00n01MOCKBILL0001"),
        "invoice_number": arg(args, "invoice_number", "INV-MOCK-001"),
        "vendor_name": "Mock Vendor Inc.",
        "amount": 1250.00,
        "currency": "USD",
        "due_date": "2026-01-31",
        "approval_status": "pending",
        "payment_status": "unpaid",
    })
}

/// 按服务 / 工具生成 Mock 响应
pub fn mock_response(service: &str, tool: &str, args: &Value) -> ToolResult {
    let body = match (service, tool) {
        ("bill_com" | "accounts_payable", "list_bills" | "search_bills") => json!({
            "bills": [mock_bill(args)],
            "total": 1,
        }),
        ("bill_com" | "accounts_payable", "get_bill") => json!({ "bill": mock_bill(args) }),
        ("bill_com" | "accounts_payable", "list_vendors") => json!({
            "vendors": [{
                "id": "00901MOCKVENDOR01",
                "name": "Mock Vendor Inc.",
                "email": "ap@mockvendor.example",
                "is_active": true,
            }],
            "total": 1,
        }),
        ("gmail", "search_emails" | "list_messages") => json!({
            "emails": [{
                "id": "mock-msg-0001",
                "from": "billing@mockvendor.example",
                "subject": format!("Re: {}", arg(args, "query", "invoice status")),
                "snippet": "Please find the updated invoice attached.",
                "date": "2026-01-15T09:30:00Z",
            }],
            "total": 1,
        }),
        ("salesforce", _) => json!({
            "records": [{
                "Id": "001MOCKACCOUNT001",
                "Name": "Mock Account",
                "Type": "Customer",
            }],
            "totalSize": 1,
            "done": true,
        }),
        ("zoho", "list_invoices" | "get_invoice") => json!({
            "invoices": [{
                "invoice_id": "MOCK-ZI-0001",
                "invoice_number": arg(args, "invoice_number", "INV-MOCK-001"),
                "status": "sent",
                "total": 1250.00,
            }],
        }),
        ("audit", _) => json!({
            "findings": [],
            "checked": arg(args, "query", ""),
            "passed": true,
        }),
        _ => json!({
            "message": format!("Mock response for {service}.{tool}"),
            "arguments": args.clone(),
        }),
    };

    let mut out = match body {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("result".into(), other);
            map
        }
    };
    out.insert("mock_mode".into(), Value::Bool(true));
    out.insert("service".into(), Value::String(service.to_string()));
    out.insert("tool".into(), Value::String(tool.to_string()));
    out
}
