//! Sample traces shared by the unit tests.

/// One instance with two activities; `checkStock` answers twice.
pub(crate) const ORDER_TRACE: &str = r#"---
log:
  trace:
    cpee:name: Order Handling
    concept:name: order
---
event:
  cpee:instance: inst-1
  cpee:activity_uuid: a1
  concept:endpoint: submitOrder
  cpee:lifecycle:transition: activity/calling
  time:timestamp: '2024-03-01T09:00:00.000+01:00'
  data:
  - name: orderId
    value: '42'
---
event:
  cpee:instance: inst-1
  cpee:activity_uuid: a1
  concept:endpoint: submitOrder
  cpee:lifecycle:transition: activity/receiving
  time:timestamp: '2024-03-01T09:00:01.500+01:00'
  data:
  - name: result
    mimetype: application/json
    data: '{"status":"ok"}'
---
event:
  cpee:instance: inst-1
  cpee:activity_uuid: a1
  concept:endpoint: submitOrder
  cpee:lifecycle:transition: activity/done
  time:timestamp: '2024-03-01T09:00:01.600+01:00'
---
event:
  cpee:instance: inst-1
  cpee:activity_uuid: a1
  cpee:lifecycle:transition: dataelements/change
  time:timestamp: '2024-03-01T09:00:01.700+01:00'
  data:
  - name: order
    value: accepted
---
event:
  cpee:instance: inst-1
  cpee:activity_uuid: a2
  concept:endpoint: checkStock
  cpee:lifecycle:transition: activity/calling
  time:timestamp: '2024-03-01T09:00:05.000+01:00'
  data:
  - name: sku
    value: A-7
  - name: qty
    value: 3
---
event:
  cpee:instance: inst-1
  cpee:activity_uuid: a2
  concept:endpoint: checkStock
  cpee:lifecycle:transition: activity/receiving
  time:timestamp: '2024-03-01T09:00:06.000+01:00'
  data:
  - name: state
    mimetype: text/plain
    data: reserved
---
event:
  cpee:instance: inst-1
  cpee:activity_uuid: a2
  concept:endpoint: checkStock
  cpee:lifecycle:transition: activity/receiving
  time:timestamp: '2024-03-01T09:00:08.000+01:00'
  data:
  - name: state
    mimetype: text/plain
    data: shipped
---
event:
  cpee:instance: inst-1
  cpee:activity_uuid: a2
  concept:endpoint: checkStock
  cpee:lifecycle:transition: activity/done
  time:timestamp: '2024-03-01T09:00:08.100+01:00'
"#;

/// A sub-process instantiation, a receive without a call, and a call that is
/// never completed.
pub(crate) const SPAWN_TRACE: &str = r#"---
log:
  trace:
    cpee:name: Spawner
---
event:
  cpee:instance: inst-2
  cpee:activity_uuid: b1
  concept:endpoint: startSubprocess
  cpee:lifecycle:transition: activity/calling
  time:timestamp: '2024-03-01T10:00:00Z'
  data:
  - name: url
    value: https://models.example.org/sub.xml
---
event:
  cpee:instance: inst-2
  cpee:activity_uuid: b1
  concept:endpoint: startSubprocess
  cpee:lifecycle:transition: task/instantiation
  time:timestamp: '2024-03-01T10:00:00.200Z'
---
event:
  cpee:instance: inst-2
  cpee:activity_uuid: b1
  concept:endpoint: startSubprocess
  cpee:lifecycle:transition: activity/done
  time:timestamp: '2024-03-01T10:00:00.300Z'
---
event:
  cpee:instance: inst-2
  cpee:activity_uuid: b2
  concept:endpoint: notify
  cpee:lifecycle:transition: activity/receiving
  time:timestamp: '2024-03-01T10:00:02Z'
  data:
  - name: ack
    mimetype: text/plain
    data: 'yes'
---
event:
  cpee:instance: inst-2
  cpee:activity_uuid: b2
  concept:endpoint: notify
  cpee:lifecycle:transition: activity/done
  time:timestamp: '2024-03-01T10:00:02.100Z'
---
event:
  cpee:instance: inst-2
  cpee:activity_uuid: b3
  concept:endpoint: archive
  cpee:lifecycle:transition: activity/calling
  time:timestamp: '2024-03-01T10:00:03Z'
  data:
  - name: id
    value: 7
"#;
