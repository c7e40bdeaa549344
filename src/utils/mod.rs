pub mod api; // 与测量服务接口通信
pub mod common; // 公共的函数：时间换算、排序等
pub mod config; // 命令行参数
pub mod files; // 与文件相关，读取目标列表、导出CSV/JSON
pub mod logger; // 日志初始化
pub mod models; // 接口返回的数据结构、统一的测量记录
pub mod network; // 与IP、域名相关的函数
pub mod normalize; // 把接口返回的数据统一成测量记录
pub mod plot; // 图表、地图用的数据整理
pub mod poller; // 探针任务的轮询
