use tracing::info;

use crate::workitem::Workitem;

pub fn consume(workitem: &Workitem) -> Workitem {
    let fields = serde_json::Value::Object(workitem.fields.clone());
    info!(
        participant = %workitem.participant_name,
        instance = %workitem.instance_id,
        fields = %fields,
        "echo participant consumed workitem"
    );
    workitem.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn echo_returns_workitem_unchanged() {
        let mut workitem = Workitem::new("wf-1", serde_json::Map::new());
        workitem
            .fields
            .insert("repo".to_string(), json!("test_repo"));
        workitem.participant_name = "fake1".to_string();
        let reply = consume(&workitem);
        assert_eq!(reply, workitem);
    }
}
