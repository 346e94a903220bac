use super::{
    Handler, NextHandler, PluginError, PluginFactory, RequestContext, ResponseWriter,
    next_or_failure,
};
use crate::utils::format_duration;
use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const NAME: &str = "log";

/// 日志插件 - 记录每个查询的来源、问题、响应码和耗时
pub struct LogPlugin {
    next: NextHandler,
}

impl LogPlugin {
    pub fn new(next: NextHandler) -> Self {
        Self { next }
    }
}

pub fn setup(args: &[String]) -> Result<PluginFactory, PluginError> {
    if let Some(extra) = args.first() {
        return Err(PluginError::InvalidArgument {
            plugin: NAME,
            argument: "none",
            value: extra.clone(),
            reason: "log 不接受参数".to_string(),
        });
    }
    Ok(Box::new(|next: NextHandler| Arc::new(LogPlugin::new(next)) as Arc<dyn Handler>))
}

fn describe(query: &Message) -> String {
    match query.queries().first() {
        Some(q) => format!("{} {}", q.name(), q.query_type()),
        None => "<empty>".to_string(),
    }
}

#[async_trait]
impl Handler for LogPlugin {
    async fn serve_dns(
        &self,
        ctx: &RequestContext,
        writer: &mut dyn ResponseWriter,
        query: &Message,
    ) -> Result<ResponseCode, PluginError> {
        let question = describe(query);
        debug!("DNS请求来自: {}, id={}, {}", ctx.client_addr, query.id(), question);

        let result = next_or_failure(NAME, self.next.as_ref(), ctx, writer, query).await;
        let elapsed = format_duration(ctx.received_at.elapsed());

        match &result {
            Ok(rcode) => info!("{} - {} -> {} ({})", ctx.client_addr, question, rcode, elapsed),
            Err(e) => warn!("{} - {} 处理失败: {} ({})", ctx.client_addr, question, e, elapsed),
        }
        result
    }

    fn name(&self) -> &str {
        NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::testing::{RecordingHandler, RecordingWriter, sample_query};

    #[tokio::test]
    async fn test_passes_through_result() {
        let inner = RecordingHandler::new(ResponseCode::NXDomain);
        let plugin = LogPlugin::new(Some(inner.clone()));
        let ctx = RequestContext::new("127.0.0.1:40000".parse().unwrap());
        let mut writer = RecordingWriter::new();

        let rcode = plugin
            .serve_dns(&ctx, &mut writer, &sample_query(7))
            .await
            .unwrap();
        assert_eq!(rcode, ResponseCode::NXDomain);
        assert_eq!(inner.calls(), 1);
    }

    #[test]
    fn test_rejects_arguments() {
        assert!(setup(&[]).is_ok());
        assert!(setup(&["verbose".to_string()]).is_err());
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe(&sample_query(1)), "example.com. A");
        assert_eq!(describe(&Message::new()), "<empty>");
    }
}
