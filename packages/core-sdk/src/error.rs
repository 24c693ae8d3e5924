use thiserror::Error;

/**
 * \brief 节点执行过程中的错误分类，对宿主统一呈现为一条描述性消息。
 */
#[derive(Debug, Error)]
pub enum NodeError {
    /** \brief 凭据或参数配置有误 */
    #[error("configuration error: {0}")]
    Configuration(String),

    /** \brief 输入数据无法解析 */
    #[error("input error: {0}")]
    Input(String),

    /** \brief 网络失败或上游返回非 2xx */
    #[error("upstream error: {0}")]
    Upstream(String),

    /** \brief 响应缺少预期字段 */
    #[error("unexpected response shape: `{path}` is missing from the provider response")]
    ResponseShape { path: &'static str },

    #[error("no model list found in provider response")]
    NoModelList,

    #[error("provider returned no usable models")]
    EmptyModelList,
}

impl From<reqwest::Error> for NodeError {
    fn from(err: reqwest::Error) -> Self {
        NodeError::Upstream(err.to_string())
    }
}

pub type NodeResult<T> = std::result::Result<T, NodeError>;
